//! TCP data path: accept loop and backend dial-through.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::net;

use super::Service;

pub(crate) async fn run(
    svc: Arc<Service>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(service = %svc.name, "listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((client, _peer)) => {
                    if let Err(err) = net::set_keepalive(&client, net::KEEPALIVE_PERIOD) {
                        tracing::debug!(service = %svc.name, error = %err, "setting keepalive");
                    }

                    let svc = svc.clone();
                    tokio::spawn(async move {
                        connect(svc, client).await;
                    });
                }
                Err(err) => {
                    // transient accept errors (EMFILE and friends) are retried
                    tracing::warn!(service = %svc.name, error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Try the preferred backend first, then fall through the rest of the list
/// to make a best effort at connecting the client.
async fn connect(svc: Arc<Service>, client: TcpStream) {
    let dial_timeout = svc.dial_timeout();
    let client_timeout = svc.client_timeout();

    for backend in svc.next() {
        match net::dial(&backend.network, &backend.addr, dial_timeout).await {
            Ok(server) => {
                backend.proxy(server, client, client_timeout).await;
                return;
            }
            Err(err) => {
                tracing::error!(
                    service = %svc.name,
                    backend = %backend.name,
                    error = %err,
                    "connecting to backend"
                );
                backend.record_error();
            }
        }
    }

    tracing::error!(service = %svc.name, "no backend available");
    // dropping the client closes the connection
}
