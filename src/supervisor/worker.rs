//! Per-camera worker record
//!
//! A worker is two tasks (driver loop + event fan-out) plus this record in
//! the supervisor table: descriptor snapshot, cancellation token and the
//! connectivity view the status loop publishes. Owned exclusively by the
//! supervisor under its mutex.

use crate::model::{CameraDescriptor, ConnectionState};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub struct WorkerRecord {
    pub descriptor: CameraDescriptor,
    pub cancel: CancellationToken,
    pub last_event_at: Option<DateTime<Utc>>,
    pub status: ConnectionState,
    pub status_since: DateTime<Utc>,
    pub status_reason: String,
    pub ever_connected: bool,
    /// Analytics the driver actually subscribed to
    pub analytics: Vec<String>,
}

impl WorkerRecord {
    pub fn new(
        descriptor: CameraDescriptor,
        cancel: CancellationToken,
        analytics: Vec<String>,
    ) -> Self {
        Self {
            descriptor,
            cancel,
            last_event_at: None,
            status: ConnectionState::Connecting,
            status_since: Utc::now(),
            status_reason: "awaiting connection".to_string(),
            ever_connected: false,
            analytics,
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            descriptor: self.descriptor.clone(),
            last_event_at: self.last_event_at,
            status: self.status,
            status_since: self.status_since,
            status_reason: self.status_reason.clone(),
            ever_connected: self.ever_connected,
            analytics: self.analytics.clone(),
        }
    }
}

/// Copy of the worker state taken under the lock and published outside it
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub descriptor: CameraDescriptor,
    pub last_event_at: Option<DateTime<Utc>>,
    pub status: ConnectionState,
    pub status_since: DateTime<Utc>,
    pub status_reason: String,
    pub ever_connected: bool,
    pub analytics: Vec<String>,
}
