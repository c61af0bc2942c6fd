//! Process-wide authoritative container of services and the vhost table.
//!
//! # Responsibilities
//! - Serialize all structural mutations (add/update/remove) under one lock
//! - Apply config diffs minimally: untouched backends keep running
//! - Keep the vhost table and service set mutually consistent
//!
//! # Locking
//! The registry lock is an async mutex because structural mutations await
//! listener binds and backend shutdowns. Lock order when more than one is
//! held: registry → service → virtual host, never the reverse.

pub mod error;
pub mod vhost;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backend::{Backend, BackendStat};
use crate::config::{filter_empty, BackendConfig, Config, ServiceConfig, StateWriter};
use crate::service::{Service, ServiceStat};

pub use error::{MultiError, RegistryError};
pub use vhost::VirtualHost;

const KNOWN_NETWORKS: [&str; 6] = ["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6"];

pub struct ServiceRegistry {
    inner: Mutex<RegistryInner>,
    admin_addr: Option<String>,
    state: Option<Arc<StateWriter>>,
}

struct RegistryInner {
    svcs: HashMap<String, Arc<Service>>,
    // multiple services may respond from a single vhost
    vhosts: HashMap<String, Arc<VirtualHost>>,
    // global defaults applied to new services at creation time
    cfg: Config,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry {
            inner: Mutex::new(RegistryInner {
                svcs: HashMap::new(),
                vhosts: HashMap::new(),
                cfg: Config::default(),
            }),
            admin_addr: None,
            state: None,
        }
    }

    /// Record the admin listener address so configured services cannot
    /// collide with its port.
    pub fn with_admin_addr(mut self, addr: impl Into<String>) -> Self {
        self.admin_addr = Some(addr.into());
        self
    }

    /// Persist the running configuration to `path` after each change.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state = Some(Arc::new(StateWriter::new(path.into())));
        self
    }

    /// Update the global defaults and add or update every service in `cfg`.
    /// Failures are accumulated so one bad service does not abort the rest.
    pub async fn update_config(&self, cfg: Config) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock().await;
            let defaults = &mut inner.cfg;

            if !cfg.balance.is_empty() {
                defaults.balance = cfg.balance.clone();
            }
            if cfg.check_interval != 0 {
                defaults.check_interval = cfg.check_interval;
            }
            if cfg.fall != 0 {
                defaults.fall = cfg.fall;
            }
            if cfg.rise != 0 {
                defaults.rise = cfg.rise;
            }
            if cfg.client_timeout != 0 {
                defaults.client_timeout = cfg.client_timeout;
            }
            if cfg.server_timeout != 0 {
                defaults.server_timeout = cfg.server_timeout;
            }
            if cfg.dial_timeout != 0 {
                defaults.dial_timeout = cfg.dial_timeout;
            }
            if cfg.https_redirect {
                defaults.https_redirect = true;
            }
        }

        let admin_port = self.admin_addr.as_deref().and_then(port_of);
        let mut errors = MultiError::default();

        for svc_cfg in cfg.services {
            if let (Some(admin_port), Some(port)) = (admin_port, port_of(&svc_cfg.addr)) {
                if admin_port == port {
                    tracing::error!(service = %svc_cfg.name, port = %port, "port already bound by the admin listener");
                    errors.push(RegistryError::PortConflict {
                        service: svc_cfg.name.clone(),
                        port: port.to_string(),
                    });
                    continue;
                }
            }

            let name = svc_cfg.name.clone();
            let result = if self.get_service(&name).await.is_none() {
                self.add_service(svc_cfg).await
            } else {
                self.update_service(svc_cfg).await
            };

            if let Err(err) = result {
                tracing::error!(service = %name, error = %err, "applying service config");
                errors.push(err);
            }
        }

        self.save_state().await;
        errors.into_result()
    }

    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.lock().await.svcs.get(name).cloned()
    }

    /// The service that handles a particular vhost, or None when the host is
    /// unknown.
    pub async fn get_vhost_service(&self, host: &str) -> Option<Arc<Service>> {
        let inner = self.inner.lock().await;
        inner.vhosts.get(host).and_then(|vhost| vhost.service())
    }

    pub async fn vhosts_len(&self) -> usize {
        self.inner.lock().await.vhosts.len()
    }

    /// Add a new service, binding its listener and starting its backends'
    /// health probes. An existing service is never replaced.
    pub async fn add_service(&self, svc_cfg: ServiceConfig) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;

        tracing::debug!(service = %svc_cfg.name, "adding service");
        if inner.svcs.contains_key(&svc_cfg.name) {
            return Err(RegistryError::DuplicateService);
        }

        let mut svc_cfg = svc_cfg;
        apply_defaults(&inner.cfg, &mut svc_cfg);
        let svc_cfg = svc_cfg.with_defaults();

        if !KNOWN_NETWORKS.contains(&svc_cfg.network.as_str()) {
            return Err(RegistryError::UnknownNetwork(svc_cfg.network));
        }

        let service = Arc::new(Service::new(&svc_cfg));
        if let Err(err) = service.start().await {
            tracing::error!(service = %service.name, error = %err, "unable to start service");
            service.stop().await;
            return Err(RegistryError::Bind(err));
        }

        inner.svcs.insert(service.name.clone(), service.clone());

        for name in filter_empty(&svc_cfg.virtual_hosts) {
            let vhost = inner
                .vhosts
                .entry(name.clone())
                .or_insert_with(|| Arc::new(VirtualHost::new(name.as_str())))
                .clone();
            vhost.add(service.clone());
        }

        Ok(())
    }

    /// Merge `new_cfg` onto the running service and apply the difference:
    /// unchanged backends keep running, changed ones are replaced, and the
    /// vhost table and error pages are re-diffed. Changing the address or
    /// client timeout requires a fresh service and is rejected.
    pub async fn update_service(&self, new_cfg: ServiceConfig) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;

        tracing::debug!(service = %new_cfg.name, "updating service");
        let service = inner
            .svcs
            .get(&new_cfg.name)
            .cloned()
            .ok_or(RegistryError::NoService)?;

        let current = service.config();
        let merged = current.merge(&new_cfg);

        service.update_config(&merged)?;

        let mut current_backends: HashMap<String, BackendConfig> = current
            .backends
            .iter()
            .map(|b| (b.name.clone(), b.clone()))
            .collect();

        for new_backend in &merged.backends {
            if let Some(cur) = current_backends.remove(&new_backend.name) {
                if cur.equal(new_backend) {
                    tracing::debug!(service = %service.name, backend = %cur.name, "backend unchanged");
                    continue;
                }
                tracing::warn!(service = %service.name, backend = %new_backend.name, "updating backend");
                service.remove(&new_backend.name).await;
            }
            service.add(Backend::new(new_backend)).await;
        }

        for name in current_backends.keys() {
            tracing::debug!(service = %service.name, backend = %name, "removing backend");
            service.remove(name).await;
        }

        if service.error_pages_cfg() != merged.error_pages {
            tracing::debug!(service = %service.name, "updating error pages");
            service.set_error_pages(merged.error_pages.clone());
        }

        update_vhosts(&mut inner, &service, filter_empty(&merged.virtual_hosts));

        Ok(())
    }

    /// Remove a service: close its listener, stop its backends' probes, and
    /// detach it from every virtual host.
    pub async fn remove_service(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;

        let svc = inner.svcs.remove(name).ok_or(RegistryError::NoService)?;
        tracing::debug!(service = %svc.name, "removing service");
        svc.stop().await;

        inner.vhosts.retain(|host, vhost| {
            vhost.remove(&svc.name);
            if vhost.is_empty() {
                tracing::debug!(vhost = %host, "removing virtual host");
                false
            } else {
                true
            }
        });

        Ok(())
    }

    /// Add a backend to an existing service. Duplicate names are rejected;
    /// use [`ServiceRegistry::update_service`] to replace one.
    pub async fn add_backend(
        &self,
        svc_name: &str,
        backend_cfg: BackendConfig,
    ) -> Result<(), RegistryError> {
        let inner = self.inner.lock().await;

        let service = inner.svcs.get(svc_name).ok_or(RegistryError::NoService)?;
        if service.get_backend(&backend_cfg.name).is_some() {
            return Err(RegistryError::DuplicateBackend);
        }

        tracing::debug!(service = %svc_name, backend = %backend_cfg.name, "adding backend");
        service.add(Backend::new(&backend_cfg)).await;
        Ok(())
    }

    pub async fn remove_backend(
        &self,
        svc_name: &str,
        backend_name: &str,
    ) -> Result<(), RegistryError> {
        let inner = self.inner.lock().await;

        tracing::debug!(service = %svc_name, backend = %backend_name, "removing backend");
        let service = inner.svcs.get(svc_name).ok_or(RegistryError::NoService)?;
        if !service.remove(backend_name).await {
            return Err(RegistryError::NoBackend);
        }
        Ok(())
    }

    pub async fn service_stats(&self, name: &str) -> Result<ServiceStat, RegistryError> {
        let inner = self.inner.lock().await;
        let service = inner.svcs.get(name).ok_or(RegistryError::NoService)?;
        Ok(service.stats())
    }

    pub async fn service_config(&self, name: &str) -> Result<ServiceConfig, RegistryError> {
        let inner = self.inner.lock().await;
        let service = inner.svcs.get(name).ok_or(RegistryError::NoService)?;
        Ok(service.config())
    }

    pub async fn backend_stats(
        &self,
        svc_name: &str,
        backend_name: &str,
    ) -> Result<BackendStat, RegistryError> {
        let inner = self.inner.lock().await;

        let service = inner.svcs.get(svc_name).ok_or(RegistryError::NoService)?;
        let backend = service
            .get_backend(backend_name)
            .ok_or(RegistryError::NoBackend)?;
        Ok(backend.stats())
    }

    pub async fn stats(&self) -> Vec<ServiceStat> {
        let inner = self.inner.lock().await;
        let mut stats: Vec<ServiceStat> = inner.svcs.values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// The authoritative current state: global defaults plus every running
    /// service's live configuration.
    pub async fn config(&self) -> Config {
        let inner = self.inner.lock().await;

        let mut cfg = inner.cfg.clone();
        cfg.services = inner.svcs.values().map(|s| s.config()).collect();
        cfg.services.sort_by(|a, b| a.name.cmp(&b.name));
        cfg
    }

    /// Persist the current configuration in the background, if a state file
    /// is configured.
    pub async fn save_state(&self) {
        let Some(writer) = self.state.clone() else {
            return;
        };

        let cfg = self.config().await;
        tokio::spawn(async move {
            writer.write(&cfg).await;
        });
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill any missing fields on a new service from the registry defaults.
fn apply_defaults(defaults: &Config, svc: &mut ServiceConfig) {
    if svc.balance.is_empty() && !defaults.balance.is_empty() {
        svc.balance = defaults.balance.clone();
    }
    if svc.check_interval == 0 && defaults.check_interval != 0 {
        svc.check_interval = defaults.check_interval;
    }
    if svc.fall == 0 && defaults.fall != 0 {
        svc.fall = defaults.fall;
    }
    if svc.rise == 0 && defaults.rise != 0 {
        svc.rise = defaults.rise;
    }
    if svc.client_timeout == 0 && defaults.client_timeout != 0 {
        svc.client_timeout = defaults.client_timeout;
    }
    if svc.server_timeout == 0 && defaults.server_timeout != 0 {
        svc.server_timeout = defaults.server_timeout;
    }
    if svc.dial_timeout == 0 && defaults.dial_timeout != 0 {
        svc.dial_timeout = defaults.dial_timeout;
    }
    if defaults.https_redirect {
        svc.https_redirect = true;
    }
}

/// Diff the vhost entries for a service against `new_hosts`, applying
/// removals first so a vhost emptied by this update is dropped from the
/// table before any additions.
fn update_vhosts(inner: &mut RegistryInner, service: &Arc<Service>, mut new_hosts: Vec<String>) {
    let mut old_hosts = service.virtual_hosts();
    old_hosts.sort();
    new_hosts.sort();

    // relative complements of the two sorted name sets
    let mut remove = Vec::new();
    let mut add = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old_hosts.len() && j < new_hosts.len() {
        match old_hosts[i].cmp(&new_hosts[j]) {
            std::cmp::Ordering::Less => {
                remove.push(old_hosts[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                add.push(new_hosts[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    remove.extend_from_slice(&old_hosts[i..]);
    add.extend_from_slice(&new_hosts[j..]);

    for name in &remove {
        let now_empty = match inner.vhosts.get(name) {
            Some(vhost) => {
                vhost.remove(&service.name);
                vhost.is_empty()
            }
            None => false,
        };
        if now_empty {
            tracing::info!(vhost = %name, "removing empty virtual host");
            inner.vhosts.remove(name);
        }
    }

    for name in add {
        let vhost = inner
            .vhosts
            .entry(name.clone())
            .or_insert_with(|| Arc::new(VirtualHost::new(name.as_str())))
            .clone();
        vhost.add(service.clone());
    }

    service.set_virtual_hosts(new_hosts);
}

fn port_of(addr: &str) -> Option<&str> {
    addr.rsplit_once(':').map(|(_, port)| port)
}
