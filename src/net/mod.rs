//! Network layer plumbing shared by the TCP and UDP data paths.
//!
//! # Responsibilities
//! - Resolve addresses honoring the configured network family
//! - Dial backends with a connect timeout
//! - Enable TCP keepalive on accepted connections
//! - Copy bytes between sockets with per-operation deadlines

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

/// Keepalive probe interval for accepted client connections.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Resolve `addr`, returning the first address matching the network family.
/// `network` is one of tcp, tcp4, tcp6, udp, udp4, udp6.
pub async fn resolve(network: &str, addr: &str) -> io::Result<SocketAddr> {
    let want_v4 = network.ends_with('4');
    let want_v6 = network.ends_with('6');

    let mut addrs = lookup_host(addr).await?;
    addrs
        .find(|a| (!want_v4 || a.is_ipv4()) && (!want_v6 || a.is_ipv6()))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address for {addr}"),
            )
        })
}

/// Connect to a backend address, bounding name resolution and the TCP
/// handshake by `timeout`. A zero timeout means no bound.
pub async fn dial(network: &str, addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let network = network.to_string();
    let addr = addr.to_string();
    bounded(timeout, async move {
        let sockaddr = resolve(&network, &addr).await?;
        TcpStream::connect(sockaddr).await
    })
    .await
}

/// Enable TCP keepalive with the given probe interval.
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period).with_interval(period))
}

/// Copy bytes from `src` to `dst` until EOF, an error, or an expired
/// deadline. Every read resets a deadline of `read_timeout` and every write
/// one of `write_timeout`; either timeout being zero disables that bound.
/// Copied bytes are accumulated into `copied` as they are written.
pub async fn splice<R, W>(
    src: &mut R,
    dst: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    copied: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = bounded(read_timeout, src.read(&mut buf)).await?;
        if n == 0 {
            // propagate the half-close so the peer sees EOF
            let _ = dst.shutdown().await;
            return Ok(total);
        }

        bounded(write_timeout, dst.write_all(&buf[..n])).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
}

/// Run an I/O future under a deadline. A zero duration means no deadline.
pub(crate) async fn bounded<F, T>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if limit.is_zero() {
        return fut.await;
    }

    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "i/o deadline exceeded",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_honors_family() {
        let addr = resolve("tcp", "127.0.0.1:80").await.unwrap();
        assert!(addr.is_ipv4());

        let addr = resolve("tcp4", "127.0.0.1:80").await.unwrap();
        assert!(addr.is_ipv4());

        // a v4 literal can never satisfy a v6-only network
        assert!(resolve("tcp6", "127.0.0.1:80").await.is_err());
    }

    #[tokio::test]
    async fn splice_counts_bytes() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let counter = AtomicU64::new(0);
        let payload = b"hello backend";

        a.write_all(payload).await.unwrap();
        drop(a);

        let mut out = Vec::new();
        let copied = splice(
            &mut b,
            &mut out,
            Duration::from_secs(1),
            Duration::from_secs(1),
            &counter,
        )
        .await
        .unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(counter.load(Ordering::Relaxed), payload.len() as u64);
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn splice_read_deadline_fires() {
        let (_a, mut b) = tokio::io::duplex(64);
        let counter = AtomicU64::new(0);
        let mut out = Vec::new();

        let err = splice(
            &mut b,
            &mut out,
            Duration::from_millis(50),
            Duration::from_millis(50),
            &counter,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
