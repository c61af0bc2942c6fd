//! Configuration loading from disk.
//!
//! Applied at startup: the state file first (resuming the last running
//! configuration), then the default config file. Unreadable or unparsable
//! files are warned about and skipped, never fatal.

use std::path::Path;

use crate::config::Config;
use crate::registry::ServiceRegistry;

pub async fn load_into(registry: &ServiceRegistry, paths: &[Option<&Path>]) {
    for path in paths.iter().flatten() {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "reading config");
                continue;
            }
        };

        let cfg: Config = match serde_json::from_slice(&data) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config error");
                continue;
            }
        };

        tracing::debug!(path = %path.display(), "loaded config");
        if let Err(err) = registry.update_config(cfg).await {
            tracing::error!(path = %path.display(), error = %err, "unable to load config");
        }
    }
}
