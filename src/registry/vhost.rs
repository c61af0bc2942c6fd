//! Virtual hosts: a hostname routed to one or more HTTP services.

use std::sync::{Arc, Mutex};

use crate::service::Service;

/// A hostname plus the services answering for it, round-robined per request.
///
/// Holds non-owning references; services keep only the set of vhost names.
pub struct VirtualHost {
    pub name: String,
    inner: Mutex<VirtualHostInner>,
}

struct VirtualHostInner {
    services: Vec<Arc<Service>>,
    // the last service we returned, so we can round-robin them
    last: usize,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>) -> VirtualHost {
        VirtualHost {
            name: name.into(),
            inner: Mutex::new(VirtualHostInner {
                services: Vec::new(),
                last: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a service; does nothing if it is already present.
    pub fn add(&self, svc: Arc<Service>) {
        let mut inner = self.inner.lock().unwrap();

        if inner.services.iter().any(|s| s.name == svc.name) {
            tracing::debug!(service = %svc.name, vhost = %self.name, "service already registered");
            return;
        }

        for backend in svc.config().backends {
            tracing::info!(backend = %backend.addr, vhost = %self.name, "adding backend to virtual host");
        }
        inner.services.push(svc);
    }

    pub fn remove(&self, svc_name: &str) {
        let mut inner = self.inner.lock().unwrap();

        let Some(found) = inner.services.iter().position(|s| s.name == svc_name) else {
            tracing::debug!(service = %svc_name, vhost = %self.name, "service not found under virtual host");
            return;
        };

        for backend in inner.services[found].config().backends {
            tracing::info!(backend = %backend.addr, vhost = %self.name, "removing backend from virtual host");
        }
        inner.services.remove(found);
    }

    /// The next service to handle a request for this vhost, cycling past
    /// services with no available backends. When every service is down the
    /// last-used one is returned anyway, so the request can still be
    /// answered with a custom error page.
    pub fn service(&self) -> Option<Arc<Service>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.services.is_empty() {
            tracing::warn!(vhost = %self.name, "no services registered");
            return None;
        }

        for i in 1..=inner.services.len() {
            let idx = (inner.last + i) % inner.services.len();
            if inner.services[idx].available() > 0 {
                inner.last = idx;
                return Some(inner.services[idx].clone());
            }
        }

        let last = inner.last.min(inner.services.len() - 1);
        Some(inner.services[last].clone())
    }
}
