//! Attendance admission ledger.
//!
//! Decides, per observation, whether a sighting is a new attendance event or a
//! repeat of one already on record. The cache is process-local and may be
//! cleared at any time; a clear costs at most one redundant event per identity.

use crate::types::{Identity, Observation};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Repeat sightings at the same location within this window are suppressed.
pub const DEFAULT_REBIND_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Append a new attendance event.
    Admit,
    /// Repeat observation; presence may still be refreshed.
    Suppress,
}

impl AdmissionDecision {
    pub fn is_admit(self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }
}

/// Last admitted check-in for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub last_checkin_at: DateTime<Utc>,
    pub last_location: String,
}

#[derive(Debug)]
pub struct AttendanceLedger {
    rebind_window: TimeDelta,
    entries: HashMap<Identity, LedgerEntry>,
}

impl Default for AttendanceLedger {
    fn default() -> Self {
        Self::new(DEFAULT_REBIND_WINDOW)
    }
}

impl AttendanceLedger {
    pub fn new(rebind_window: Duration) -> Self {
        Self {
            rebind_window: TimeDelta::from_std(rebind_window).unwrap_or(TimeDelta::MAX),
            entries: HashMap::new(),
        }
    }

    pub fn rebind_window(&self) -> TimeDelta {
        self.rebind_window
    }

    /// Decide without touching the cache.
    ///
    /// A location change always admits. A clock that moved backwards yields a
    /// negative elapsed time and therefore suppresses until the window passes.
    pub fn evaluate(&self, identity: &Identity, location: &str, now: DateTime<Utc>) -> AdmissionDecision {
        match self.entries.get(identity) {
            None => AdmissionDecision::Admit,
            Some(entry) if entry.last_location != location => AdmissionDecision::Admit,
            Some(entry) if now - entry.last_checkin_at >= self.rebind_window => AdmissionDecision::Admit,
            Some(_) => AdmissionDecision::Suppress,
        }
    }

    /// Remember an admitted check-in. Call only once the event is durable.
    pub fn record(&mut self, identity: &Identity, location: &str, now: DateTime<Utc>) {
        self.entries.insert(
            identity.clone(),
            LedgerEntry {
                last_checkin_at: now,
                last_location: location.to_string(),
            },
        );
    }

    /// Evaluate and, on admission, record in one step.
    pub fn admit(&mut self, identity: &Identity, location: &str, now: DateTime<Utc>) -> AdmissionDecision {
        let decision = self.evaluate(identity, location, now);
        if decision.is_admit() {
            self.record(identity, location, now);
        }
        decision
    }

    pub fn admit_observation(&mut self, observation: &Observation) -> AdmissionDecision {
        self.admit(&observation.identity, &observation.location, observation.observed_at)
    }

    /// Drop every cached entry. Returns how many were cleared.
    pub fn reset(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }

    pub fn entry(&self, identity: &Identity) -> Option<&LedgerEntry> {
        self.entries.get(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
