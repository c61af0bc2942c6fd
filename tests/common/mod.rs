//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// A TCP backend that answers every received chunk with its own address,
/// so tests can tell which backend served a connection.
pub struct TestServer {
    pub addr: String,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        Self::bind("127.0.0.1:0").await
    }

    /// Bind a specific address, for restart-on-same-port scenarios.
    pub async fn bind(addr: &str) -> TestServer {
        let listener = TcpListener::bind(addr).await.unwrap();
        let local = listener.local_addr().unwrap().to_string();

        let response = local.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                if sock.write_all(response.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        TestServer {
            addr: local,
            handle,
        }
    }

    /// Close the listener. Established connections keep running.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// A UDP backend that records every datagram it receives and optionally
/// echoes it back to the sender.
pub struct UdpTestServer {
    pub addr: String,
    pub packets: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl UdpTestServer {
    pub async fn bind(addr: &str, echo: bool) -> UdpTestServer {
        let sock = UdpSocket::bind(addr).await.unwrap();
        let local = sock.local_addr().unwrap().to_string();
        let packets = Arc::new(Mutex::new(Vec::new()));

        let seen = packets.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 65507];
            loop {
                let Ok((n, from)) = sock.recv_from(&mut buf).await else {
                    return;
                };
                seen.lock().unwrap().push(buf[..n].to_vec());
                if echo {
                    let _ = sock.send_to(&buf[..n], from).await;
                }
            }
        });

        UdpTestServer {
            addr: local,
            packets,
            handle,
        }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// A minimal HTTP/1.1 server returning a fixed response, for backend and
/// error-page fetch targets.
pub struct HttpTestServer {
    pub addr: String,
    handle: JoinHandle<()>,
}

impl HttpTestServer {
    pub async fn start(
        status: u16,
        content_type: &'static str,
        body: &'static str,
    ) -> HttpTestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    // read the request head before answering
                    let mut buf = [0u8; 4096];
                    let mut head = Vec::new();
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                head.extend_from_slice(&buf[..n]);
                                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }

                    let reason = match status {
                        200 => "OK",
                        502 => "Bad Gateway",
                        503 => "Service Unavailable",
                        _ => "OK",
                    };
                    let response = format!(
                        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        reason,
                        content_type,
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        HttpTestServer {
            addr: local,
            handle,
        }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// Connect to a proxied address, write a probe line, and check which backend
/// answered.
pub async fn check_resp(addr: &str, expected: &str) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"testing\n").await.unwrap();

    let mut buf = [0u8; 1024];
    let n = conn.read(&mut buf).await.unwrap();
    let resp = String::from_utf8_lossy(&buf[..n]);

    assert!(n > 0, "no response from {addr}");
    if !expected.is_empty() {
        assert_eq!(resp, expected);
    }
}
