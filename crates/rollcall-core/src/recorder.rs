//! Couples ledger admission with persistence.
//!
//! The cache entry for an admitted observation is written only after the
//! attendance event reached the store, so a failed write is retried on the
//! next sighting instead of being silently suppressed.

use crate::ledger::AttendanceLedger;
use crate::store::{AttendanceStore, StoreError};
use crate::types::Observation;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Admitted and appended to the attendance log.
    Appended,
    /// Repeat sighting, nothing appended.
    Suppressed,
    /// Admitted but the write failed or timed out; the cache was left untouched.
    Failed,
    /// Admitted while running without a store.
    Unpersisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordReport {
    pub event: EventOutcome,
    pub presence_stored: bool,
}

pub struct AttendanceRecorder<S> {
    ledger: Arc<Mutex<AttendanceLedger>>,
    store: Option<S>,
    write_timeout: Option<Duration>,
    /// Set while store writes keep failing; repeats are logged at debug.
    store_failing: AtomicBool,
}

impl<S: AttendanceStore> AttendanceRecorder<S> {
    /// `store = None` runs in no-persistence mode: decisions are made but
    /// nothing is recorded, and the cache never fills.
    pub fn new(ledger: Arc<Mutex<AttendanceLedger>>, store: Option<S>) -> Self {
        Self {
            ledger,
            store,
            write_timeout: None,
            store_failing: AtomicBool::new(false),
        }
    }

    /// Give up on any single store write after `limit`. A timed-out event
    /// write counts as failed, so the next sighting retries it.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = Some(limit);
        self
    }

    pub fn ledger(&self) -> &Arc<Mutex<AttendanceLedger>> {
        &self.ledger
    }

    pub fn store(&self) -> Option<&S> {
        self.store.as_ref()
    }

    /// Whether the most recent store write failed.
    pub fn store_failing(&self) -> bool {
        self.store_failing.load(Ordering::Relaxed)
    }

    /// Process one observation. Never fails; store errors are logged and
    /// reflected in the report.
    pub async fn observe(&self, observation: &Observation) -> RecordReport {
        let decision = lock_ledger(&self.ledger).evaluate(
            &observation.identity,
            &observation.location,
            observation.observed_at,
        );

        let Some(store) = &self.store else {
            tracing::debug!(
                identity = %observation.identity,
                location = %observation.location,
                "attendance not recorded: running without a store"
            );
            let event = if decision.is_admit() {
                EventOutcome::Unpersisted
            } else {
                EventOutcome::Suppressed
            };
            return RecordReport { event, presence_stored: false };
        };

        let event = if decision.is_admit() {
            match self.bounded(store.append_event(observation)).await {
                Ok(()) => {
                    lock_ledger(&self.ledger).record(
                        &observation.identity,
                        &observation.location,
                        observation.observed_at,
                    );
                    tracing::info!(
                        identity = %observation.identity,
                        location = %observation.location,
                        at = %observation.observed_at,
                        "attendance recorded"
                    );
                    EventOutcome::Appended
                }
                Err(err) => {
                    self.write_failed("attendance", observation, &err);
                    EventOutcome::Failed
                }
            }
        } else {
            tracing::debug!(
                identity = %observation.identity,
                location = %observation.location,
                "repeat sighting suppressed"
            );
            EventOutcome::Suppressed
        };

        let presence_stored = match self.bounded(store.upsert_presence(observation)).await {
            Ok(()) => true,
            Err(err) => {
                self.write_failed("presence", observation, &err);
                false
            }
        };

        RecordReport { event, presence_stored }
    }

    /// Clear the ledger cache.
    pub fn reset(&self) -> usize {
        lock_ledger(&self.ledger).reset()
    }

    async fn bounded(&self, write: impl Future<Output = Result<(), StoreError>>) -> Result<(), StoreError> {
        let result = match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .unwrap_or(Err(StoreError::Timeout(limit))),
            None => write.await,
        };
        if result.is_ok() && self.store_failing.swap(false, Ordering::Relaxed) {
            tracing::info!("store writes recovered");
        }
        result
    }

    /// Warn on the first failure of a run; later ones go to debug.
    fn write_failed(&self, table: &'static str, observation: &Observation, err: &StoreError) {
        if self.store_failing.swap(true, Ordering::Relaxed) {
            tracing::debug!(table, identity = %observation.identity, error = %err, "store write failed again");
        } else {
            tracing::warn!(
                table,
                identity = %observation.identity,
                location = %observation.location,
                error = %err,
                "store write failed; attendance will be retried on the next sighting"
            );
        }
    }
}

/// Lock the shared ledger. A panicking holder cannot leave it half-updated,
/// so a poisoned lock is recovered.
pub fn lock_ledger(ledger: &Mutex<AttendanceLedger>) -> MutexGuard<'_, AttendanceLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}
