//! Balancing policies.
//!
//! Both policies operate over the service's live backend list and are called
//! under the service lock, so updates to the round-robin cursor are atomic
//! with the list itself.

use std::sync::Arc;

use crate::backend::Backend;
use crate::config::{LEAST_CONN, ROUND_ROBIN};

/// Selection policy over a service's backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceMode {
    #[default]
    RoundRobin,
    LeastConn,
}

impl BalanceMode {
    /// Parse a configured balance value. Unknown values are logged and fall
    /// back to round-robin.
    pub fn parse(value: &str) -> BalanceMode {
        match value {
            ROUND_ROBIN | "" => BalanceMode::RoundRobin,
            LEAST_CONN => BalanceMode::LeastConn,
            other => {
                tracing::warn!(balance = %other, "invalid balancing algorithm");
                BalanceMode::RoundRobin
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceMode::RoundRobin => ROUND_ROBIN,
            BalanceMode::LeastConn => LEAST_CONN,
        }
    }
}

/// Weighted round-robin: return the full backend list rotated so the next
/// backend to try comes first, repeating each head up to its weight before
/// advancing. The caller may fall through to later entries when the head
/// refuses the connection.
///
/// Returns an empty list when no backend is up.
pub fn round_robin(
    backends: &[Arc<Backend>],
    last_backend: &mut usize,
    last_count: &mut usize,
) -> Vec<Arc<Backend>> {
    let n = backends.len();
    if n == 0 || !backends.iter().any(|b| b.up()) {
        return Vec::new();
    }

    // the cursor may be out of range if we lost a backend
    if *last_backend >= n {
        *last_backend = 0;
        *last_count = 0;
    }

    if *last_count >= backends[*last_backend].weight as usize {
        *last_backend = (*last_backend + 1) % n;
        *last_count = 0;
    }
    *last_count += 1;

    // never select a down head; bounded because at least one backend is up
    while !backends[*last_backend].up() {
        *last_backend = (*last_backend + 1) % n;
        *last_count = 1;
    }

    let mut rotated = Vec::with_capacity(n);
    rotated.extend_from_slice(&backends[*last_backend..]);
    rotated.extend_from_slice(&backends[..*last_backend]);
    rotated
}

/// Least-connected: the up backends sorted ascending by active connection
/// count, ties broken by current order.
pub fn least_conn(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    let mut up: Vec<Arc<Backend>> = backends.iter().filter(|b| b.up()).cloned().collect();
    up.sort_by_key(|b| b.active());
    up
}
