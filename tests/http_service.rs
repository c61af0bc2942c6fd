//! HTTP path: redirects, maintenance mode, forwarding, and error pages.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use http::{header, Request, StatusCode};
use http_body_util::BodyExt;

use skiff::config::{BackendConfig, ServiceConfig};
use skiff::ServiceRegistry;

use common::HttpTestServer;

fn http_service(name: &str, port: u16) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        addr: format!("127.0.0.1:{port}"),
        virtual_hosts: vec!["www.example.com".into()],
        ..Default::default()
    }
}

fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header(header::HOST, "www.example.com")
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn forwards_to_backend_and_counts() {
    let backend = HttpTestServer::start(200, "text/plain", "hello from upstream").await;
    let registry = ServiceRegistry::new();

    let mut cfg = http_service("web", 2400);
    cfg.backends.push(BackendConfig {
        name: "b0".into(),
        addr: backend.addr.clone(),
        ..Default::default()
    });
    registry.add_service(cfg).await.unwrap();

    let svc = registry.get_vhost_service("www.example.com").await.unwrap();
    let response = svc.serve_http(get_request("/hello")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "hello from upstream");

    let stats = registry.service_stats("web").await.unwrap();
    assert_eq!(stats.http_conns, 1);
    assert_eq!(stats.http_errors, 0);
    assert_eq!(stats.http_active, 0);
    assert_eq!(stats.backends[0].conns, 1);

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn https_redirect_issues_301() {
    let registry = ServiceRegistry::new();

    let mut cfg = http_service("web", 2401);
    cfg.https_redirect = true;
    registry.add_service(cfg).await.unwrap();

    let svc = registry.get_service("web").await.unwrap();

    let response = svc.serve_http(get_request("/account?tab=keys")).await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://www.example.com/account?tab=keys"
    );

    // a request already terminated as https upstream is not redirected
    let mut req = get_request("/account");
    req.headers_mut()
        .insert("x-forwarded-proto", "https".parse().unwrap());
    let response = svc.serve_http(req).await;
    assert_ne!(response.status(), StatusCode::MOVED_PERMANENTLY);

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn maintenance_mode_returns_503_with_error_page() {
    let page = HttpTestServer::start(200, "text/html", "<h1>back soon</h1>").await;
    let registry = ServiceRegistry::new();

    let mut cfg = http_service("web", 2402);
    cfg.maintenance_mode = true;
    cfg.error_pages = BTreeMap::from([(format!("http://{}/503.html", page.addr), vec![503u16])]);
    registry.add_service(cfg).await.unwrap();

    // the page is fetched in the background
    tokio::time::sleep(Duration::from_millis(300)).await;

    let svc = registry.get_service("web").await.unwrap();
    let response = svc.serve_http(get_request("/")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    assert_eq!(body_string(response).await, "<h1>back soon</h1>");

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn unreachable_backends_produce_502_and_error_stats() {
    let registry = ServiceRegistry::new();

    let mut cfg = http_service("web", 2403);
    cfg.backends.push(BackendConfig {
        name: "b0".into(),
        // bind-then-drop leaves a port with nothing listening
        addr: "127.0.0.1:2404".into(),
        ..Default::default()
    });
    registry.add_service(cfg).await.unwrap();

    let svc = registry.get_service("web").await.unwrap();
    let response = svc.serve_http(get_request("/")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let stats = registry.service_stats("web").await.unwrap();
    assert_eq!(stats.http_errors, 1);
    assert_eq!(stats.backends[0].errors, 1);

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn error_page_substitutes_matching_status() {
    let page = HttpTestServer::start(200, "text/html", "<h1>oops</h1>").await;
    let registry = ServiceRegistry::new();

    let mut cfg = http_service("web", 2405);
    cfg.error_pages = BTreeMap::from([(format!("http://{}/502.html", page.addr), vec![502u16])]);
    cfg.backends.push(BackendConfig {
        name: "b0".into(),
        addr: "127.0.0.1:2406".into(),
        ..Default::default()
    });
    registry.add_service(cfg).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let svc = registry.get_service("web").await.unwrap();
    let response = svc.serve_http(get_request("/")).await;

    // the dial failure still yields 502, but with the substituted body
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_string(response).await, "<h1>oops</h1>");

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn dial_failure_falls_through_to_next_backend() {
    let backend = HttpTestServer::start(200, "text/plain", "second backend").await;
    let registry = ServiceRegistry::new();

    let mut cfg = http_service("web", 2407);
    cfg.backends.push(BackendConfig {
        name: "dead".into(),
        addr: "127.0.0.1:2408".into(),
        ..Default::default()
    });
    cfg.backends.push(BackendConfig {
        name: "live".into(),
        addr: backend.addr.clone(),
        ..Default::default()
    });
    registry.add_service(cfg).await.unwrap();

    let svc = registry.get_service("web").await.unwrap();

    // the first pick may be the dead backend; the proxy must retry the
    // connect failure against the live one
    for _ in 0..2 {
        let response = svc.serve_http(get_request("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let stats = registry.service_stats("web").await.unwrap();
    assert_eq!(stats.http_errors, 0);
    let dead = stats.backends.iter().find(|b| b.name == "dead").unwrap();
    assert!(dead.errors >= 1);

    registry.remove_service("web").await.unwrap();
}
