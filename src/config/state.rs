//! State-file persistence.
//!
//! The registry's authoritative configuration is written out after each
//! change so a restart can resume where it left off. Writes are serialized
//! by a mutex, skipped when the serialized form is unchanged, and staged
//! through a temp file so the state file is replaced atomically.

use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::config::Config;

pub struct StateWriter {
    path: PathBuf,
    // the last bytes written, to skip no-op writes
    last: Mutex<Vec<u8>>,
}

impl StateWriter {
    pub fn new(path: PathBuf) -> StateWriter {
        StateWriter {
            path,
            last: Mutex::new(Vec::new()),
        }
    }

    pub async fn write(&self, cfg: &Config) {
        let mut last = self.last.lock().await;

        let bytes = cfg.marshal();
        if bytes.is_empty() {
            return;
        }

        if *last == bytes {
            tracing::debug!(path = %self.path.display(), "no change in config");
            return;
        }

        // after a restart the file may already hold this exact state
        if last.is_empty() {
            if let Ok(current) = tokio::fs::read(&self.path).await {
                if current == bytes {
                    *last = bytes;
                    return;
                }
            }
        }

        let tmp = self.path.with_extension("tmp");
        let result = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "saved config state");
                *last = bytes;
            }
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "can't save config state");
            }
        }
    }
}
