use rollcall_core::{lock_ledger, AttendanceLedger};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Clear the ledger cache every `every`, starting one period from now, until
/// `shutdown` flips to true.
pub fn spawn_cache_reset(
    ledger: Arc<Mutex<AttendanceLedger>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cleared = lock_ledger(&ledger).reset();
                    tracing::info!(cleared, "attendance cache reset");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("cache reset task stopped");
    })
}
