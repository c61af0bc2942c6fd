//! Reverse-proxy collaborator for HTTP services.
//!
//! Forwards a request to the first backend that accepts the connection,
//! falling through the balancer-ordered address list on connect failures.
//! Connect failures are distinguished from application failures so only the
//! former are retried against another backend; a failure after the request
//! has been sent is never replayed.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::CONNECTION;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// The outcome of one forwarded request, consumed by the response pipeline.
pub struct ProxyRequest {
    pub response: Response,
    /// Address of the backend that produced the response, if any.
    pub backend: Option<String>,
    /// Transport failure reported by the proxy. Application-level error
    /// statuses from the backend do not set this.
    pub proxy_error: Option<String>,
    /// Addresses that refused the connection before one accepted.
    pub dial_failures: Vec<String>,
}

pub struct HttpProxy {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpProxy {
    pub fn new() -> HttpProxy {
        HttpProxy {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    /// Forward `req` to the first reachable address in `addrs`. The body is
    /// buffered up front so a connect failure can be retried on the next
    /// backend.
    pub async fn forward(&self, req: Request<Body>, addrs: &[String]) -> ProxyRequest {
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                // the client went away mid-request; nothing to retry
                tracing::debug!(error = %err, "reading request body");
                return ProxyRequest {
                    response: StatusCode::BAD_REQUEST.into_response(),
                    backend: None,
                    proxy_error: None,
                    dial_failures: Vec::new(),
                };
            }
        };

        let mut dial_failures = Vec::new();
        let mut last_error = None;

        for addr in addrs {
            let upstream_req = match build_request(&parts, addr, body.clone()) {
                Some(req) => req,
                None => {
                    dial_failures.push(addr.clone());
                    continue;
                }
            };

            match self.client.request(upstream_req).await {
                Ok(resp) => {
                    let (head, incoming) = resp.into_parts();
                    return ProxyRequest {
                        response: Response::from_parts(head, Body::new(incoming)),
                        backend: Some(addr.clone()),
                        proxy_error: None,
                        dial_failures,
                    };
                }
                Err(err) if err.is_connect() => {
                    dial_failures.push(addr.clone());
                    last_error = Some(err.to_string());
                }
                Err(err) => {
                    // the request may have reached the backend; retrying
                    // against another one could duplicate it
                    return ProxyRequest {
                        response: (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response(),
                        backend: Some(addr.clone()),
                        proxy_error: Some(err.to_string()),
                        dial_failures,
                    };
                }
            }
        }

        ProxyRequest {
            response: (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response(),
            backend: None,
            proxy_error: Some(last_error.unwrap_or_else(|| "no backend available".to_string())),
            dial_failures,
        }
    }
}

impl Default for HttpProxy {
    fn default() -> Self {
        Self::new()
    }
}

fn build_request(
    parts: &http::request::Parts,
    addr: &str,
    body: Bytes,
) -> Option<Request<Full<Bytes>>> {
    let authority = Authority::try_from(addr).ok()?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .ok()?;

    let mut req = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Full::new(body))
        .ok()?;

    *req.headers_mut() = parts.headers.clone();
    // hop-by-hop headers are not forwarded
    req.headers_mut().remove(CONNECTION);
    req.headers_mut().remove("keep-alive");

    Some(req)
}
