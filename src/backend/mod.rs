//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream endpoint
//! - Track health state driven by the periodic probe in `check`
//! - Keep transfer and connection counters
//! - Splice bytes between a client and an upstream connection

pub mod check;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BackendConfig;
use crate::net;

/// A single upstream endpoint with its own health state and stats.
///
/// Timeouts and check parameters are inherited from the owning service when
/// the backend is added to it.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub addr: String,
    pub network: String,
    pub check_addr: String,
    pub weight: u32,

    up: AtomicBool,
    check_fail: AtomicU64,
    check_ok: AtomicU64,

    sent: AtomicU64,
    rcvd: AtomicU64,
    errors: AtomicU64,
    conns: AtomicU64,
    active: AtomicI64,
    http_active: AtomicI64,

    rw_timeout: Duration,
    dial_timeout: Duration,
    check_interval: Duration,
    fall: u32,
    rise: u32,

    probe: Mutex<Option<Probe>>,
}

#[derive(Debug)]
struct Probe {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Stats snapshot for a backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStat {
    pub name: String,
    #[serde(rename = "address")]
    pub addr: String,
    #[serde(rename = "check_address")]
    pub check_addr: String,
    pub up: bool,
    pub weight: u32,
    pub sent: u64,
    #[serde(rename = "received")]
    pub rcvd: u64,
    pub errors: u64,
    #[serde(rename = "connections")]
    pub conns: u64,
    pub active: i64,
    pub http_active: i64,
    pub check_fail: u64,
    pub check_ok: u64,
}

impl Backend {
    pub fn new(cfg: &BackendConfig) -> Backend {
        let cfg = cfg.with_defaults();

        Backend {
            name: cfg.name,
            addr: cfg.addr,
            network: cfg.network,
            check_addr: cfg.check_addr,
            weight: cfg.weight,
            up: AtomicBool::new(true),
            check_fail: AtomicU64::new(0),
            check_ok: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            rcvd: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            conns: AtomicU64::new(0),
            active: AtomicI64::new(0),
            http_active: AtomicI64::new(0),
            rw_timeout: Duration::ZERO,
            dial_timeout: Duration::ZERO,
            check_interval: Duration::ZERO,
            fall: 0,
            rise: 0,
            probe: Mutex::new(None),
        }
    }

    /// Adopt the owning service's timeouts and check parameters. Called by
    /// the service before the backend is started.
    pub(crate) fn inherit(
        &mut self,
        rw_timeout: Duration,
        dial_timeout: Duration,
        check_interval: Duration,
        fall: u32,
        rise: u32,
    ) {
        self.rw_timeout = rw_timeout;
        self.dial_timeout = dial_timeout;
        self.check_interval = check_interval;
        self.fall = fall;
        self.rise = rise;
    }

    /// Begin the health-check task. Without a check address no task runs and
    /// the backend stays permanently up.
    pub fn start(self: &std::sync::Arc<Self>) {
        if self.check_addr.is_empty() {
            return;
        }

        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(check::run(self.clone(), stopped));

        *self.probe.lock().unwrap() = Some(Probe { stop, task });
    }

    /// Signal the health-check task to exit and wait for it. Idempotent.
    pub async fn stop(&self) {
        let probe = self.probe.lock().unwrap().take();
        if let Some(probe) = probe {
            let _ = probe.stop.send(true);
            let _ = probe.task.await;
        }
    }

    /// Current health state.
    pub fn up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_active(&self, n: i64) {
        self.active.store(n, Ordering::Relaxed);
    }

    /// Record a failure reaching this backend on the data path. Health state
    /// is owned by the probe and is not touched here.
    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a proxied HTTP request served by this backend.
    pub(crate) fn record_http_request(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub(crate) async fn probe_once(&self) -> bool {
        net::dial("tcp", &self.check_addr, self.dial_timeout)
            .await
            .is_ok()
    }

    /// Splice bytes between the upstream and the client until either side
    /// closes or a read/write deadline expires. Returns once both directions
    /// have ended.
    pub async fn proxy(&self, server: TcpStream, client: TcpStream, client_timeout: Duration) {
        self.conns.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        let _guard = ActiveGuard(&self.active);

        let (mut client_rd, mut client_wr) = client.into_split();
        let (mut server_rd, mut server_wr) = server.into_split();

        let upload = net::splice(
            &mut client_rd,
            &mut server_wr,
            client_timeout,
            self.rw_timeout,
            &self.sent,
        );
        let download = net::splice(
            &mut server_rd,
            &mut client_wr,
            self.rw_timeout,
            client_timeout,
            &self.rcvd,
        );

        tokio::pin!(upload, download);

        // A closed connection on either half terminates both: returning
        // drops both sockets, which ends the other direction.
        let res = tokio::select! {
            res = &mut upload => res,
            res = &mut download => res,
        };

        if let Err(err) = res {
            if err.kind() != std::io::ErrorKind::TimedOut {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(backend = %self.name, error = %err, "proxy ended");
            }
        }
    }

    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            name: self.name.clone(),
            addr: self.addr.clone(),
            network: self.network.clone(),
            check_addr: self.check_addr.clone(),
            weight: self.weight,
        }
    }

    pub fn stats(&self) -> BackendStat {
        BackendStat {
            name: self.name.clone(),
            addr: self.addr.clone(),
            check_addr: self.check_addr.clone(),
            up: self.up(),
            weight: self.weight,
            sent: self.sent.load(Ordering::Relaxed),
            rcvd: self.rcvd.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            conns: self.conns.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            http_active: self.http_active.load(Ordering::Relaxed),
            check_fail: self.check_fail.load(Ordering::Relaxed),
            check_ok: self.check_ok.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active-connection gauge when the proxy handler returns.
struct ActiveGuard<'a>(&'a AtomicI64);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
