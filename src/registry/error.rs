//! Error taxonomy for registry mutations.
//!
//! Data-path failures never surface here; they are absorbed into counters.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service does not exist")]
    NoService,

    #[error("backend does not exist")]
    NoBackend,

    #[error("service already exists")]
    DuplicateService,

    #[error("backend already exists")]
    DuplicateBackend,

    /// An update would change a field that requires a fresh listener.
    #[error("configuration requires a new service")]
    InvalidServiceUpdate,

    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    /// A service tried to bind the port the admin surface owns.
    #[error("port conflict: service {service} port {port} already bound")]
    PortConflict { service: String, port: String },

    /// The listening socket could not be opened.
    #[error("binding listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error(transparent)]
    Multi(MultiError),
}

impl RegistryError {
    /// Whether this is a lookup failure, for HTTP status mapping.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NoService | RegistryError::NoBackend)
    }
}

/// Aggregate of independent per-service failures from a config update, so a
/// single bad service does not abort the whole update.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<RegistryError>,
}

impl MultiError {
    pub fn push(&mut self, err: RegistryError) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[RegistryError] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), RegistryError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msgs: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join(", "))
    }
}

impl std::error::Error for MultiError {}
