//! UDP forwarding plane.
//!
//! One receive loop per service. Each client address maps to an upstream
//! socket in the connection-track table, kept for the service's lifetime;
//! a dedicated reply task per flow carries return traffic back through the
//! shared listener. The reply task is the sole remover of its table entry
//! and the sole closer of the upstream socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::backend::Backend;
use crate::net;

use super::Service;

/// Largest payload a UDP/IPv4 datagram can carry.
pub(crate) const UDP_BUF_SIZE: usize = 65507;

/// Idle deadline after which a tracked flow expires.
pub(crate) const UDP_CONN_TRACK_TIMEOUT: Duration = Duration::from_secs(90);

/// Identifies a client flow: (IP high 64 bits, IP low 64 bits, port), with
/// IPv4 addresses zero-extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnTrackKey {
    ip_high: u64,
    ip_low: u64,
    port: u16,
}

/// A tracked flow: the upstream socket and the backend it is connected to.
/// When the balancer picks a different backend for the client the entry is
/// re-dialed, so weighting is honored across datagrams.
#[derive(Clone)]
pub(crate) struct FlowEntry {
    backend_addr: String,
    socket: Arc<UdpSocket>,
}

impl ConnTrackKey {
    pub(crate) fn new(addr: &SocketAddr) -> ConnTrackKey {
        match addr.ip() {
            IpAddr::V4(ip) => ConnTrackKey {
                ip_high: 0,
                ip_low: u32::from(ip) as u64,
                port: addr.port(),
            },
            IpAddr::V6(ip) => {
                let bits = u128::from(ip);
                ConnTrackKey {
                    ip_high: (bits >> 64) as u64,
                    ip_low: bits as u64,
                    port: addr.port(),
                }
            }
        }
    }
}

pub(crate) async fn run(
    svc: Arc<Service>,
    listener: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        let (read, from) = tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(service = %svc.name, "udp listener closed");
                return;
            }
            received = listener.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(service = %svc.name, error = %err, "udp receive");
                    svc.record_error();
                    continue;
                }
            }
        };

        if read == 0 {
            continue;
        }
        svc.add_rcvd(read);

        // no backend up: the datagram is silently dropped
        let Some(backend) = svc.next_udp() else {
            continue;
        };

        let key = ConnTrackKey::new(&from);
        let tracked = svc.conn_track.get(&key).and_then(|entry| {
            (entry.backend_addr == backend.addr).then(|| entry.socket.clone())
        });
        let upstream = match tracked {
            Some(sock) => sock,
            None => match open_flow(&svc, &listener, &backend, from, key).await {
                Some(sock) => sock,
                None => continue,
            },
        };

        match upstream.send(&buf[..read]).await {
            Ok(n) => svc.add_sent(n),
            Err(err) => {
                tracing::error!(
                    service = %svc.name,
                    backend = %backend.name,
                    error = %err,
                    "udp forward"
                );
                svc.record_error();
            }
        }
    }
}

/// Dial a new upstream socket for a client, track it, and start its reply
/// task.
async fn open_flow(
    svc: &Arc<Service>,
    listener: &Arc<UdpSocket>,
    backend: &Arc<Backend>,
    client: SocketAddr,
    key: ConnTrackKey,
) -> Option<Arc<UdpSocket>> {
    let remote = match net::resolve(&backend.network, &backend.addr).await {
        Ok(addr) => addr,
        Err(err) => {
            tracing::warn!(service = %svc.name, backend = %backend.name, error = %err, "resolving backend");
            svc.record_error();
            return None;
        }
    };

    let local = if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };

    let upstream = match UdpSocket::bind(local).await {
        Ok(sock) => sock,
        Err(err) => {
            tracing::warn!(service = %svc.name, error = %err, "binding upstream socket");
            svc.record_error();
            return None;
        }
    };

    if let Err(err) = upstream.connect(remote).await {
        tracing::warn!(service = %svc.name, backend = %backend.name, error = %err, "connecting upstream socket");
        svc.record_error();
        return None;
    }

    let upstream = Arc::new(upstream);
    svc.conn_track.insert(
        key,
        FlowEntry {
            backend_addr: backend.addr.clone(),
            socket: upstream.clone(),
        },
    );
    tokio::spawn(reply_loop(
        svc.clone(),
        listener.clone(),
        upstream.clone(),
        client,
        key,
    ));

    Some(upstream)
}

/// Carry return traffic for one flow back to the client until the upstream
/// errors or the idle deadline fires, then untrack the flow.
async fn reply_loop(
    svc: Arc<Service>,
    listener: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    client: SocketAddr,
    key: ConnTrackKey,
) {
    let mut shutdown = svc.shutdown.subscribe();
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = tokio::time::timeout(UDP_CONN_TRACK_TIMEOUT, upstream.recv(&mut buf)) => received,
        };

        let read = match received {
            // flow idle, expire it
            Err(_) => break,
            // the last write bounced off a port nobody is listening on yet;
            // keep reading until the deadline
            Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => continue,
            Ok(Err(_)) => break,
            Ok(Ok(n)) => n,
        };

        match listener.send_to(&buf[..read], client).await {
            Ok(n) => svc.add_sent(n),
            Err(err) => {
                tracing::error!(service = %svc.name, error = %err, "udp reply");
                svc.record_error();
                break;
            }
        }
    }

    // only untrack our own flow; the entry may have been re-dialed to a
    // different backend in the meantime
    svc.conn_track
        .remove_if(&key, |_, entry| Arc::ptr_eq(&entry.socket, &upstream));
    // dropping the last reference closes the upstream socket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_track_key_zero_extends_ipv4() {
        let addr: SocketAddr = "10.1.2.3:5353".parse().unwrap();
        let key = ConnTrackKey::new(&addr);

        assert_eq!(key.ip_high, 0);
        assert_eq!(key.ip_low, u32::from_be_bytes([10, 1, 2, 3]) as u64);
        assert_eq!(key.port, 5353);
    }

    #[test]
    fn conn_track_key_distinguishes_ports() {
        let a = ConnTrackKey::new(&"10.0.0.1:1000".parse().unwrap());
        let b = ConnTrackKey::new(&"10.0.0.1:1001".parse().unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn conn_track_key_splits_ipv6() {
        let addr: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let key = ConnTrackKey::new(&addr);

        assert_eq!(key.ip_high, 0x2001_0db8_0000_0000);
        assert_eq!(key.ip_low, 1);
    }
}
