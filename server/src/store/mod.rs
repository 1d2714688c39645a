//! Device state, directory and assignment storage
//!
//! The store is the system of record. The core never caches authoritative
//! copies of devices or assignments; it applies one conditional write per
//! operation and reads back the result.
//!
//! Two backends are provided:
//! - [`MemoryStore`] for tests and store-less deployments
//! - [`SqliteStore`] for durable single-node deployments

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use fleetsync_shared::state_machine::{
    next_status, AssignmentEvent, AssignmentStatus, TransitionResult,
};
use fleetsync_shared::GeoPoint;

use crate::error::StoreError;

/// Operational status of a tracked unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Available,
    InFlight,
    Maintenance,
    Charging,
    Active,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Available => "available",
            DeviceStatus::InFlight => "in_flight",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Charging => "charging",
            DeviceStatus::Active => "active",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(DeviceStatus::Available),
            "in_flight" => Ok(DeviceStatus::InFlight),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            "charging" => Ok(DeviceStatus::Charging),
            "active" => Ok(DeviceStatus::Active),
            other => Err(StoreError::Unavailable(format!(
                "corrupt device status: {other}"
            ))),
        }
    }
}

/// Last known state of one tracked unit
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub display_name: String,
    pub location: GeoPoint,
    pub battery_level: f64,
    pub status: DeviceStatus,
    pub updated_at_ms: u64,
}

/// Default display name given to auto-provisioned devices
pub fn default_display_name(device_id: &str) -> String {
    format!("Drone {device_id}")
}

/// A validated location report, ready to be applied
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub device_id: String,
    pub location: GeoPoint,
    pub battery_level: f64,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub operator_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub destination: GeoPoint,
}

/// One ordered visit on a route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStop {
    pub order_id: String,
    /// 1-based, contiguous within a route
    pub sequence_number: u32,
    pub estimated_arrival_ms: u64,
    pub location: GeoPoint,
}

/// Orders grouped under one operator+drone pairing
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub assignment_id: String,
    pub operator_id: String,
    pub drone_id: String,
    /// Orders in visit order
    pub order_ids: Vec<String>,
    pub status: AssignmentStatus,
    pub scheduled_at_ms: u64,
    pub started_at_ms: Option<u64>,
    /// Set when the assignment completes or is cancelled
    pub finished_at_ms: Option<u64>,
    pub route: Vec<RouteStop>,
    pub total_distance_km: f64,
    pub estimated_duration_minutes: u32,
}

impl Assignment {
    /// Move this copy through `event`, stamping the lifecycle timestamps.
    ///
    /// Leaves the copy untouched when the current status does not accept the event.
    pub(crate) fn apply(&mut self, event: AssignmentEvent, at_ms: u64) -> Result<(), StoreError> {
        match next_status(self.status, event) {
            TransitionResult::Success(status) => {
                self.status = status;
                match event {
                    AssignmentEvent::Start => self.started_at_ms = Some(at_ms),
                    AssignmentEvent::Complete | AssignmentEvent::Cancel => {
                        self.finished_at_ms = Some(at_ms)
                    }
                }
                Ok(())
            }
            TransitionResult::Invalid { from, .. } => Err(StoreError::StatusMismatch {
                id: self.assignment_id.clone(),
                actual: from,
            }),
        }
    }
}

/// Device state store
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert-or-update keyed by device id, as one atomic write.
    ///
    /// Existing records get the new location and battery, `status = active`
    /// and `updated_at = received_at`; their display name is untouched.
    /// Unknown ids are created with [`default_display_name`].
    async fn upsert_location(&self, fix: LocationFix) -> Result<DeviceRecord, StoreError>;

    /// Create a device if it does not exist yet; existing records are returned as-is
    async fn provision_device(
        &self,
        device_id: &str,
        display_name: &str,
        location: GeoPoint,
        status: DeviceStatus,
    ) -> Result<DeviceRecord, StoreError>;

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;
}

/// Operators and orders, resolved by the scheduler
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_operator(&self, operator_id: &str) -> Result<Option<Operator>, StoreError>;

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    async fn upsert_operator(&self, operator: Operator) -> Result<(), StoreError>;

    async fn upsert_order(&self, order: Order) -> Result<(), StoreError>;
}

/// Assignment persistence with order locking
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Persist a new assignment and lock its orders in one conditional write.
    ///
    /// Fails with [`StoreError::OrdersLocked`] (and writes nothing) when any
    /// order is held by a non-terminal assignment.
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), StoreError>;

    async fn get_assignment(&self, assignment_id: &str) -> Result<Option<Assignment>, StoreError>;

    async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Assignment>, StoreError>;

    /// Apply `event` only if the assignment is in one of the event's source
    /// states; terminal targets release the order locks in the same write.
    async fn transition(
        &self,
        assignment_id: &str,
        event: AssignmentEvent,
        at_ms: u64,
    ) -> Result<Assignment, StoreError>;

    /// Assignment currently holding `order_id`, if any
    async fn order_holder(&self, order_id: &str) -> Result<Option<String>, StoreError>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::assignment;
    use super::*;

    #[test]
    fn test_apply_stamps_lifecycle_times() {
        let mut a = assignment("a1", &["o1"]);

        a.apply(AssignmentEvent::Start, 5_000).expect("start");
        assert_eq!(a.status, AssignmentStatus::Active);
        assert_eq!(a.started_at_ms, Some(5_000));
        assert_eq!(a.finished_at_ms, None);

        a.apply(AssignmentEvent::Complete, 9_000).expect("complete");
        assert_eq!(a.status, AssignmentStatus::Completed);
        assert_eq!(a.started_at_ms, Some(5_000));
        assert_eq!(a.finished_at_ms, Some(9_000));
    }

    #[test]
    fn test_rejected_apply_leaves_copy_untouched() {
        let mut a = assignment("a1", &["o1"]);
        let before = a.clone();

        let err = a.apply(AssignmentEvent::Complete, 5_000).expect_err("pending");
        assert_eq!(
            err,
            StoreError::StatusMismatch {
                id: "a1".into(),
                actual: AssignmentStatus::Pending,
            }
        );
        assert_eq!(a, before);
    }
}
