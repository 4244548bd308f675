//! Persistence seam for attendance events and presence records.

use crate::types::Observation;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("store is closed")]
    Closed,
    #[error("store write timed out after {0:?}")]
    Timeout(Duration),
}

/// Durable storage for the attendance log and the latest-seen table.
pub trait AttendanceStore: Send + Sync {
    /// Append one row to the attendance log.
    fn append_event(&self, observation: &Observation) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert or overwrite the identity's latest-seen row.
    fn upsert_presence(&self, observation: &Observation) -> impl Future<Output = Result<(), StoreError>> + Send;
}
