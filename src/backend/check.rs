//! Periodic health probe driving a backend's up/down state.
//!
//! The probe opens a TCP connection to the backend's check address on every
//! interval. Consecutive failures and successes drive the state machine:
//!
//! ```text
//! Up   → Down: `fall` consecutive failures
//! Down → Up:   `rise` consecutive successes
//! ```
//!
//! Hysteresis prevents flapping; counters reset on the opposite outcome.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::Backend;

pub(crate) async fn run(backend: Arc<Backend>, mut stop: watch::Receiver<bool>) {
    let period = backend.check_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut fails = 0u32;
    let mut oks = 0u32;

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }

        if backend.probe_once().await {
            backend.check_ok.fetch_add(1, Ordering::Relaxed);
            oks += 1;
            fails = 0;

            if !backend.up() && oks >= backend.rise {
                backend.set_up(true);
                tracing::info!(
                    backend = %backend.name,
                    check_addr = %backend.check_addr,
                    "backend up"
                );
            }
        } else {
            backend.check_fail.fetch_add(1, Ordering::Relaxed);
            fails += 1;
            oks = 0;

            if backend.up() && fails >= backend.fall {
                backend.set_up(false);
                tracing::warn!(
                    backend = %backend.name,
                    check_addr = %backend.check_addr,
                    "backend down"
                );
            }
        }
    }
}
