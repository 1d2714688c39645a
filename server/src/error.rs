//! Error taxonomy for the FleetSync core
//!
//! Authentication and scheduler errors are returned to the immediate caller.
//! Ingestion errors never reach the reporting channel; they are only visible
//! through logs and the report observer.

use fleetsync_shared::state_machine::{AssignmentEvent, AssignmentStatus};
use thiserror::Error;

/// Handshake credential rejected. Every variant means "unauthenticated":
/// the channel is refused before any registry mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,

    #[error("Malformed credential: {0}")]
    Malformed(String),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Credential signature does not verify")]
    BadSignature,

    #[error("Credential expired at {expires_at_ms}")]
    Expired { expires_at_ms: u64 },

    #[error("Credential issued in the future ({issued_at_ms})")]
    NotYetValid { issued_at_ms: u64 },
}

/// A location report that failed validation and was discarded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReport {
    #[error("Device id is empty")]
    EmptyDeviceId,

    #[error("Report carries no location")]
    MissingLocation,

    #[error("Battery level {0} outside 0..=100")]
    BatteryOutOfRange(f64),

    #[error("Coordinates ({latitude}, {longitude}) out of range")]
    LocationOutOfRange { latitude: f64, longitude: f64 },
}

/// Failures at the durable-store boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Orders already held by another assignment: {}", .0.join(", "))]
    OrdersLocked(Vec<String>),

    #[error("Assignment {id} is {actual}")]
    StatusMismatch {
        id: String,
        actual: AssignmentStatus,
    },

    #[error("Assignment not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] InvalidReport),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("Invalid transition: cannot {event} assignment {id} while {from}")]
    InvalidTransition {
        id: String,
        from: AssignmentStatus,
        event: AssignmentEvent,
    },

    #[error("Assignment not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => SchedulerError::StoreUnavailable(msg),
            StoreError::OrdersLocked(ids) => SchedulerError::InvalidAssignment(format!(
                "orders already assigned: {}",
                ids.join(", ")
            )),
            StoreError::NotFound(id) => SchedulerError::NotFound(id),
            // Transition errors carry the event; callers map StatusMismatch themselves.
            StoreError::StatusMismatch { id, actual } => SchedulerError::InvalidAssignment(
                format!("assignment {id} is {actual}"),
            ),
        }
    }
}
