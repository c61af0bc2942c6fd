//! Configuration schema definitions.
//!
//! These are the value objects exchanged with the control surface and
//! persisted in the state file. All types derive Serde traits; the JSON field
//! names are part of the wire format and must not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Balancing schemes.
pub const ROUND_ROBIN: &str = "RR";
pub const LEAST_CONN: &str = "LC";

/// Default timeout in milliseconds for client and server connections.
pub const DEFAULT_TIMEOUT: u64 = 2000;

/// Default interval in milliseconds between health checks.
pub const DEFAULT_CHECK_INTERVAL: u64 = 5000;

/// Default network connections are TCP.
pub const DEFAULT_NET: &str = "tcp";

/// All round-robin backends are weighted, with a default of 1.
pub const DEFAULT_WEIGHT: u32 = 1;

/// Round-robin is the default balancing scheme.
pub const DEFAULT_BALANCE: &str = ROUND_ROBIN;

/// Default for fall and rise is 2.
pub const DEFAULT_FALL: u32 = 2;
pub const DEFAULT_RISE: u32 = 2;

/// Global configuration for all services.
/// Defaults set here can be overridden by individual services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Balance method: "RR" for round-robin (the default) or "LC" for
    /// least-connected.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub balance: String,

    /// Time in milliseconds between backend health checks.
    pub check_interval: u64,

    /// Number of failed health checks before a backend is marked down.
    pub fall: u32,

    /// Number of successful health checks before a down backend is marked up.
    pub rise: u32,

    /// Maximum inactivity time, in milliseconds, for a connection to the
    /// client before it is closed.
    pub client_timeout: u64,

    /// Maximum inactivity time, in milliseconds, for a connection to the
    /// backend before it is closed.
    pub server_timeout: u64,

    /// Timeout in milliseconds for connections to the backend, including
    /// name resolution.
    #[serde(rename = "connect_timeout")]
    pub dial_timeout: u64,

    /// Redirect non-https requests to https on all services. A request
    /// counts as https when it carries an "X-Forwarded-Proto: https" header.
    #[serde(rename = "https-redirect")]
    pub https_redirect: bool,

    /// One entry per service. A service corresponds to one listening socket
    /// and a number of backends to proxy.
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Serialize with services sorted by name, so equal configurations
    /// produce identical bytes.
    pub fn marshal(&self) -> Vec<u8> {
        let mut cfg = self.clone();
        cfg.services.sort_by(|a, b| a.name.cmp(&b.name));
        for svc in &mut cfg.services {
            svc.backends.sort_by(|a, b| a.name.cmp(&b.name));
        }
        let mut js = serde_json::to_vec_pretty(&cfg).unwrap_or_default();
        js.push(b'\n');
        js
    }
}

/// Parameters unique to an individual backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Must be unique within the owning service.
    pub name: String,

    /// Must be in the form host:port.
    #[serde(rename = "address")]
    pub addr: String,

    /// One of tcp, tcp4, tcp6, udp, udp4, udp6. Default is "tcp".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,

    /// host:port to TCP-connect against to determine availability. If empty,
    /// no checks are performed and the backend is always up.
    #[serde(rename = "check_address")]
    pub check_addr: String,

    /// Weight for round-robin balancing. Default is 1.
    pub weight: u32,
}

impl BackendConfig {
    /// Return a copy with default values filled in.
    pub fn with_defaults(&self) -> BackendConfig {
        let mut cfg = self.clone();
        if cfg.weight == 0 {
            cfg.weight = DEFAULT_WEIGHT;
        }
        if cfg.network.is_empty() {
            cfg.network = DEFAULT_NET.to_string();
        }
        cfg
    }

    /// Compare configurations after defaults are applied.
    pub fn equal(&self, other: &BackendConfig) -> bool {
        self.with_defaults() == other.with_defaults()
    }
}

/// The subset of service fields carried in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unique name of the service, used for reference and in the HTTP API.
    pub name: String,

    /// Listening address for this service, in the form host:port.
    #[serde(rename = "address")]
    pub addr: String,

    /// One of tcp, tcp4, tcp6, udp, udp4, udp6. Default is "tcp".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,

    /// Balance method: "RR" or "LC".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub balance: String,

    /// Time in milliseconds between backend health checks.
    pub check_interval: u64,

    /// Failed checks before a backend is marked down.
    pub fall: u32,

    /// Successful checks before a down backend is marked up.
    pub rise: u32,

    /// Client-side inactivity timeout in milliseconds.
    pub client_timeout: u64,

    /// Backend-side inactivity timeout in milliseconds.
    pub server_timeout: u64,

    /// Backend connect timeout in milliseconds, including name resolution.
    #[serde(rename = "connect_timeout")]
    pub dial_timeout: u64,

    /// Redirect non-https requests to https.
    #[serde(rename = "https-redirect")]
    pub https_redirect: bool,

    /// Virtual hostnames for which this service handles HTTP requests.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_hosts: Vec<String>,

    /// Custom responses for HTTP error codes: a URL mapped to the list of
    /// status codes that should return the content at that URL. Pages are
    /// fetched ahead of time when possible, and cached.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub error_pages: BTreeMap<String, Vec<u16>>,

    /// All backends handling connections for this service.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendConfig>,

    /// Return 503 to HTTP clients without visiting backends.
    pub maintenance_mode: bool,
}

impl ServiceConfig {
    /// Return a copy with any unset fields filled from the crate defaults.
    pub fn with_defaults(&self) -> ServiceConfig {
        let mut cfg = self.clone();
        if cfg.balance.is_empty() {
            cfg.balance = DEFAULT_BALANCE.to_string();
        }
        if cfg.check_interval == 0 {
            cfg.check_interval = DEFAULT_CHECK_INTERVAL;
        }
        if cfg.client_timeout == 0 {
            cfg.client_timeout = DEFAULT_TIMEOUT;
        }
        if cfg.server_timeout == 0 {
            cfg.server_timeout = DEFAULT_TIMEOUT;
        }
        if cfg.rise == 0 {
            cfg.rise = DEFAULT_RISE;
        }
        if cfg.fall == 0 {
            cfg.fall = DEFAULT_FALL;
        }
        if cfg.network.is_empty() {
            cfg.network = DEFAULT_NET.to_string();
        }
        cfg
    }

    /// Compare service settings, ignoring the backends, virtual hosts and
    /// error pages. Equality here means an update needs no new listener;
    /// backend and vhost changes are diffed separately.
    pub fn equal(&self, other: &ServiceConfig) -> bool {
        let a = self.with_defaults();
        let b = other.with_defaults();

        a.name == b.name
            && a.addr == b.addr
            && a.network == b.network
            && a.balance == b.balance
            && a.check_interval == b.check_interval
            && a.fall == b.fall
            && a.rise == b.rise
            && a.client_timeout == b.client_timeout
            && a.server_timeout == b.server_timeout
            && a.dial_timeout == b.dial_timeout
            && a.https_redirect == b.https_redirect
            && a.maintenance_mode == b.maintenance_mode
    }

    /// Equality including backends.
    pub fn deep_equal(&self, other: &ServiceConfig) -> bool {
        if !self.equal(other) || self.backends.len() != other.backends.len() {
            return false;
        }

        let mut a = self.backends.clone();
        let mut b = other.backends.clone();
        a.sort_by(|x, y| x.name.cmp(&y.name));
        b.sort_by(|x, y| x.name.cmp(&y.name));

        a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
    }

    /// Create a new config by overlaying the set fields of `cfg` onto self.
    pub fn merge(&self, cfg: &ServiceConfig) -> ServiceConfig {
        let mut merged = self.clone();

        // never rename a service through a merge
        merged.name = cfg.name.clone();

        if !cfg.addr.is_empty() {
            merged.addr = cfg.addr.clone();
        }
        if !cfg.network.is_empty() {
            merged.network = cfg.network.clone();
        }
        if !cfg.balance.is_empty() {
            merged.balance = cfg.balance.clone();
        }
        if cfg.check_interval != 0 {
            merged.check_interval = cfg.check_interval;
        }
        if cfg.fall != 0 {
            merged.fall = cfg.fall;
        }
        if cfg.rise != 0 {
            merged.rise = cfg.rise;
        }
        if cfg.client_timeout != 0 {
            merged.client_timeout = cfg.client_timeout;
        }
        if cfg.server_timeout != 0 {
            merged.server_timeout = cfg.server_timeout;
        }
        if cfg.dial_timeout != 0 {
            merged.dial_timeout = cfg.dial_timeout;
        }
        if !cfg.virtual_hosts.is_empty() {
            merged.virtual_hosts = cfg.virtual_hosts.clone();
        }
        if !cfg.error_pages.is_empty() {
            merged.error_pages = cfg.error_pages.clone();
        }
        if !cfg.backends.is_empty() {
            merged.backends = cfg.backends.clone();
        }

        merged.https_redirect = cfg.https_redirect;
        merged.maintenance_mode = cfg.maintenance_mode;

        merged
    }

    /// Serialize with backends sorted by name.
    pub fn marshal(&self) -> Vec<u8> {
        let mut cfg = self.clone();
        cfg.backends.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_vec_pretty(&cfg).unwrap_or_default()
    }
}

/// Remove empty and whitespace-only entries from a list of names.
pub fn filter_empty(names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .cloned()
        .collect()
}
