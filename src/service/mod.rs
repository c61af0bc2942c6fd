//! Service runtime.
//!
//! A service owns one listening socket, the pool of backends it forwards to,
//! a balancing policy, and per-service counters. HTTP services additionally
//! carry a virtual-host set and an error-page cache.
//!
//! # Locking
//! Structural state (backend list, balancer cursor, timeouts, vhost names)
//! lives behind one `std::sync::Mutex`, never held across await points.
//! Counters are atomics outside any lock. The UDP connection-track table has
//! its own sharded locks via `DashMap`.

pub mod balance;
pub mod tcp;
pub mod udp;

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use http::{Request, StatusCode};
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::backend::{Backend, BackendStat};
use crate::config::ServiceConfig;
use crate::http::error_pages::{ErrorPage, ErrorResponse};
use crate::http::proxy::{HttpProxy, ProxyRequest};
use crate::net;
use crate::registry::error::RegistryError;

use balance::BalanceMode;

/// One listening endpoint and the pool of backends it forwards to.
pub struct Service {
    pub name: String,
    pub addr: String,
    pub network: String,

    // immutable after creation; changing it requires a new service
    client_timeout: Duration,

    inner: Mutex<ServiceInner>,

    sent: AtomicU64,
    rcvd: AtomicU64,
    errors: AtomicU64,
    http_conns: AtomicU64,
    http_errors: AtomicU64,
    http_active: AtomicI64,

    shutdown: watch::Sender<bool>,

    http_proxy: HttpProxy,
    error_pages: ErrorResponse,

    // UDP client flows to their upstream sockets
    conn_track: DashMap<udp::ConnTrackKey, udp::FlowEntry>,
}

struct ServiceInner {
    backends: Vec<Arc<Backend>>,
    balance: BalanceMode,

    // weighted round-robin cursor
    last_backend: usize,
    last_count: usize,

    check_interval: u64,
    fall: u32,
    rise: u32,
    server_timeout: Duration,
    dial_timeout: Duration,

    https_redirect: bool,
    maintenance_mode: bool,
    virtual_hosts: Vec<String>,
    err_pages_cfg: BTreeMap<String, Vec<u16>>,
}

/// Stats snapshot for a service, embedding its backends.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStat {
    pub name: String,
    #[serde(rename = "address")]
    pub addr: String,
    pub virtual_hosts: Vec<String>,
    pub backends: Vec<BackendStat>,
    pub balance: String,
    pub check_interval: u64,
    pub fall: u32,
    pub rise: u32,
    pub client_timeout: u64,
    pub server_timeout: u64,
    #[serde(rename = "connect_timeout")]
    pub dial_timeout: u64,
    pub sent: u64,
    #[serde(rename = "received")]
    pub rcvd: u64,
    pub errors: u64,
    #[serde(rename = "connections")]
    pub conns: u64,
    pub active: i64,
    pub http_active: i64,
    #[serde(rename = "http_connections")]
    pub http_conns: u64,
    pub http_errors: u64,
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn family(network: &str) -> &str {
    &network[..network.len().min(3)]
}

impl Service {
    /// Build a service from its configuration. The listener is not bound
    /// until [`Service::start`].
    pub fn new(cfg: &ServiceConfig) -> Service {
        let cfg = cfg.with_defaults();
        let (shutdown, _) = watch::channel(false);

        let error_pages = ErrorResponse::new();
        if !cfg.error_pages.is_empty() {
            error_pages.update(&cfg.error_pages);
        }

        let svc = Service {
            name: cfg.name.clone(),
            addr: cfg.addr.clone(),
            network: cfg.network.clone(),
            client_timeout: ms(cfg.client_timeout),
            inner: Mutex::new(ServiceInner {
                backends: Vec::new(),
                balance: BalanceMode::parse(&cfg.balance),
                last_backend: 0,
                last_count: 0,
                check_interval: cfg.check_interval,
                fall: cfg.fall,
                rise: cfg.rise,
                server_timeout: ms(cfg.server_timeout),
                dial_timeout: ms(cfg.dial_timeout),
                https_redirect: cfg.https_redirect,
                maintenance_mode: cfg.maintenance_mode,
                virtual_hosts: cfg.virtual_hosts.clone(),
                err_pages_cfg: cfg.error_pages.clone(),
            }),
            sent: AtomicU64::new(0),
            rcvd: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            http_conns: AtomicU64::new(0),
            http_errors: AtomicU64::new(0),
            http_active: AtomicI64::new(0),
            shutdown,
            http_proxy: HttpProxy::new(),
            error_pages,
            conn_track: DashMap::new(),
        };

        for backend in &cfg.backends {
            svc.insert(Backend::new(backend));
        }

        svc
    }

    /// Bind the listening socket and start the accept/receive loop.
    pub async fn start(self: &Arc<Self>) -> io::Result<()> {
        match family(&self.network) {
            "tcp" => {
                tracing::info!(service = %self.name, addr = %self.addr, "starting TCP listener");
                let sockaddr = net::resolve(&self.network, &self.addr).await?;
                let listener = TcpListener::bind(sockaddr).await?;
                tokio::spawn(tcp::run(self.clone(), listener, self.shutdown.subscribe()));
            }
            "udp" => {
                tracing::info!(service = %self.name, addr = %self.addr, "starting UDP listener");
                let sockaddr = net::resolve(&self.network, &self.addr).await?;
                let socket = Arc::new(UdpSocket::bind(sockaddr).await?);
                tokio::spawn(udp::run(self.clone(), socket, self.shutdown.subscribe()));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown network '{}'", self.network),
                ));
            }
        }

        Ok(())
    }

    /// Close the listener, terminating the accept loop, and stop every
    /// backend's health probe. Established connections are not drained; they
    /// run until their own deadlines fire.
    pub async fn stop(&self) {
        tracing::info!(service = %self.name, network = %self.network, addr = %self.addr, "stopping listener");
        let _ = self.shutdown.send(true);

        let backends: Vec<Arc<Backend>> = self.inner.lock().unwrap().backends.clone();
        for backend in backends {
            backend.stop().await;
        }
    }

    /// Apply a merged configuration to the running service. Fields that
    /// require a fresh listener are rejected.
    pub fn update_config(&self, cfg: &ServiceConfig) -> Result<(), RegistryError> {
        if self.client_timeout != ms(cfg.client_timeout) {
            return Err(RegistryError::InvalidServiceUpdate);
        }
        if !self.addr.is_empty() && self.addr != cfg.addr {
            return Err(RegistryError::InvalidServiceUpdate);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.check_interval = cfg.check_interval;
        inner.fall = cfg.fall;
        inner.rise = cfg.rise;
        inner.server_timeout = ms(cfg.server_timeout);
        inner.dial_timeout = ms(cfg.dial_timeout);
        inner.https_redirect = cfg.https_redirect;
        inner.maintenance_mode = cfg.maintenance_mode;

        let mode = BalanceMode::parse(&cfg.balance);
        if inner.balance != mode {
            inner.balance = mode;
            inner.last_backend = 0;
            inner.last_count = 0;
        }

        Ok(())
    }

    /// Add or replace a backend, inheriting this service's timeouts and
    /// check parameters. A replaced backend is stopped gracefully.
    pub async fn add(&self, backend: Backend) {
        if let Some(old) = self.insert(backend) {
            old.stop().await;
        }
    }

    fn insert(&self, mut backend: Backend) -> Option<Arc<Backend>> {
        let mut inner = self.inner.lock().unwrap();

        tracing::info!(
            service = %self.name,
            backend = %backend.name,
            addr = %backend.addr,
            network = %backend.network,
            "adding backend"
        );

        backend.inherit(
            inner.server_timeout,
            inner.dial_timeout,
            ms(inner.check_interval),
            inner.fall,
            inner.rise,
        );

        if family(&self.network) != family(&backend.network) {
            tracing::error!(
                service = %self.name,
                backend = %backend.name,
                network = %backend.network,
                "backend network family does not match service"
            );
        }

        let backend = Arc::new(backend);
        backend.start();

        if let Some(pos) = inner.backends.iter().position(|b| b.name == backend.name) {
            Some(std::mem::replace(&mut inner.backends[pos], backend))
        } else {
            inner.backends.push(backend);
            None
        }
    }

    /// Remove a backend by name, stopping its health probe. Returns false
    /// when no backend matches.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .backends
                .iter()
                .position(|b| b.name == name)
                .map(|pos| inner.backends.remove(pos))
        };

        match removed {
            Some(backend) => {
                tracing::info!(service = %self.name, backend = %backend.name, "removing backend");
                backend.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.inner
            .lock()
            .unwrap()
            .backends
            .iter()
            .find(|b| b.name == name)
            .cloned()
    }

    pub(crate) fn backend_by_addr(&self, addr: &str) -> Option<Arc<Backend>> {
        self.inner
            .lock()
            .unwrap()
            .backends
            .iter()
            .find(|b| b.addr == addr)
            .cloned()
    }

    /// The backends in the order they should be tried, per the balancing
    /// policy. Empty when no backend is up.
    pub fn next(&self) -> Vec<Arc<Backend>> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        match inner.balance {
            BalanceMode::RoundRobin => {
                balance::round_robin(&inner.backends, &mut inner.last_backend, &mut inner.last_count)
            }
            BalanceMode::LeastConn => balance::least_conn(&inner.backends),
        }
    }

    /// Balancer-ordered backend addresses, for the HTTP forwarding path.
    pub fn next_addrs(&self) -> Vec<String> {
        self.next().iter().map(|b| b.addr.clone()).collect()
    }

    pub(crate) fn next_udp(&self) -> Option<Arc<Backend>> {
        self.next().into_iter().next()
    }

    /// Number of backends currently up. Zero while in maintenance mode.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        if inner.maintenance_mode {
            return 0;
        }
        inner.backends.iter().filter(|b| b.up()).count()
    }

    pub fn virtual_hosts(&self) -> Vec<String> {
        self.inner.lock().unwrap().virtual_hosts.clone()
    }

    pub(crate) fn set_virtual_hosts(&self, hosts: Vec<String>) {
        self.inner.lock().unwrap().virtual_hosts = hosts;
    }

    pub(crate) fn error_pages_cfg(&self) -> BTreeMap<String, Vec<u16>> {
        self.inner.lock().unwrap().err_pages_cfg.clone()
    }

    pub(crate) fn set_error_pages(&self, pages: BTreeMap<String, Vec<u16>>) {
        self.inner.lock().unwrap().err_pages_cfg = pages.clone();
        self.error_pages.update(&pages);
    }

    pub(crate) fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub(crate) fn dial_timeout(&self) -> Duration {
        self.inner.lock().unwrap().dial_timeout
    }

    pub(crate) fn add_rcvd(&self, n: usize) {
        self.rcvd.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServiceStat {
        let inner = self.inner.lock().unwrap();

        let mut stat = ServiceStat {
            name: self.name.clone(),
            addr: self.addr.clone(),
            virtual_hosts: inner.virtual_hosts.clone(),
            backends: Vec::with_capacity(inner.backends.len()),
            balance: inner.balance.as_str().to_string(),
            check_interval: inner.check_interval,
            fall: inner.fall,
            rise: inner.rise,
            client_timeout: self.client_timeout.as_millis() as u64,
            server_timeout: inner.server_timeout.as_millis() as u64,
            dial_timeout: inner.dial_timeout.as_millis() as u64,
            sent: self.sent.load(Ordering::Relaxed),
            rcvd: self.rcvd.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            conns: 0,
            active: 0,
            http_active: self.http_active.load(Ordering::Relaxed),
            http_conns: self.http_conns.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
        };

        for backend in &inner.backends {
            let bs = backend.stats();
            stat.sent += bs.sent;
            stat.rcvd += bs.rcvd;
            stat.errors += bs.errors;
            stat.conns += bs.conns;
            stat.active += bs.active;
            stat.backends.push(bs);
        }

        stat
    }

    pub fn config(&self) -> ServiceConfig {
        let inner = self.inner.lock().unwrap();

        ServiceConfig {
            name: self.name.clone(),
            addr: self.addr.clone(),
            network: self.network.clone(),
            balance: inner.balance.as_str().to_string(),
            check_interval: inner.check_interval,
            fall: inner.fall,
            rise: inner.rise,
            client_timeout: self.client_timeout.as_millis() as u64,
            server_timeout: inner.server_timeout.as_millis() as u64,
            dial_timeout: inner.dial_timeout.as_millis() as u64,
            https_redirect: inner.https_redirect,
            virtual_hosts: inner.virtual_hosts.clone(),
            error_pages: inner.err_pages_cfg.clone(),
            backends: inner.backends.iter().map(|b| b.config()).collect(),
            maintenance_mode: inner.maintenance_mode,
        }
    }

    /// Handle one HTTP request for this service on behalf of the vhost
    /// listener.
    pub async fn serve_http(&self, req: Request<Body>) -> Response {
        self.http_conns.fetch_add(1, Ordering::Relaxed);
        self.http_active.fetch_add(1, Ordering::Relaxed);
        let _active = HttpActiveGuard(&self.http_active);

        let (https_redirect, maintenance) = {
            let inner = self.inner.lock().unwrap();
            (inner.https_redirect, inner.maintenance_mode)
        };

        if https_redirect && !forwarded_https(&req) {
            let host = req
                .headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let request_uri = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let location = format!("https://{host}{request_uri}");

            return (
                StatusCode::MOVED_PERMANENTLY,
                [(http::header::LOCATION, location)],
            )
                .into_response();
        }

        if maintenance {
            tracing::info!(service = %self.name, status = 503, "maintenance mode");
            let response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            return match self.error_pages.get(StatusCode::SERVICE_UNAVAILABLE.as_u16()) {
                Some(page) => substitute(response.status(), &page),
                None => response,
            };
        }

        let pr = self.http_proxy.forward(req, &self.next_addrs()).await;

        // response pipeline: request log, error stats, page substitution
        self.log_http_response(&pr);
        if pr.proxy_error.is_some() {
            self.http_errors.fetch_add(1, Ordering::Relaxed);
        }
        for addr in &pr.dial_failures {
            if let Some(backend) = self.backend_by_addr(addr) {
                backend.record_error();
            }
        }
        if let Some(addr) = &pr.backend {
            if let Some(backend) = self.backend_by_addr(addr) {
                backend.record_http_request();
            }
        }

        let response = pr.response;
        match self.error_pages.get(response.status().as_u16()) {
            Some(page) => substitute(response.status(), &page),
            None => response,
        }
    }

    fn log_http_response(&self, pr: &ProxyRequest) {
        match &pr.proxy_error {
            Some(err) => tracing::warn!(
                service = %self.name,
                status = pr.response.status().as_u16(),
                backend = pr.backend.as_deref().unwrap_or("-"),
                error = %err,
                "proxied request"
            ),
            None => tracing::info!(
                service = %self.name,
                status = pr.response.status().as_u16(),
                backend = pr.backend.as_deref().unwrap_or("-"),
                "proxied request"
            ),
        }
    }
}

fn forwarded_https(req: &Request<Body>) -> bool {
    req.headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// Replace a response with a cached error page, keeping the status code.
fn substitute(status: StatusCode, page: &ErrorPage) -> Response {
    let mut response = (status, page.body.clone()).into_response();
    for (name, value) in page.headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

/// Decrements the in-flight HTTP gauge when the handler returns.
struct HttpActiveGuard<'a>(&'a AtomicI64);

impl Drop for HttpActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
