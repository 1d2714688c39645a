//! Assignment scheduler
//!
//! Groups orders under an operator+drone pairing, sequences them into a route
//! with arrival estimates, and drives the assignment lifecycle:
//!
//! ```text
//! pending --start--> active --complete--> completed
//!    |                  |
//!    +------cancel------+---------------> cancelled
//! ```
//!
//! Every state change is a single conditional write in the store, so a
//! rejected operation leaves the assignment exactly as it was.

mod route;

pub use route::{
    haversine_km, PlannedRoute, RouteConfig, RouteError, RoutePlanner, MAX_LEG_MS,
    MIN_CRUISE_SPEED_MPS, MIN_LEG_MS,
};

use std::collections::HashSet;
use std::sync::Arc;

use fleetsync_shared::state_machine::{AssignmentEvent, AssignmentStatus};
use fleetsync_shared::{now_ms, GeoPoint};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{SchedulerError, StoreError};
use crate::store::{Assignment, AssignmentStore, DeviceStore, Directory};

/// Optional overrides for route construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteHints {
    /// Visit order; must be a permutation of the assignment's orders
    pub order_sequence: Option<Vec<String>>,
    /// Starting point; defaults to the drone's last known location
    pub origin: Option<GeoPoint>,
    /// Departure time; defaults to now
    pub scheduled_at_ms: Option<u64>,
}

pub struct AssignmentScheduler {
    devices: Arc<dyn DeviceStore>,
    directory: Arc<dyn Directory>,
    assignments: Arc<dyn AssignmentStore>,
    planner: RoutePlanner,
}

impl AssignmentScheduler {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        directory: Arc<dyn Directory>,
        assignments: Arc<dyn AssignmentStore>,
        planner: RoutePlanner,
    ) -> Self {
        Self {
            devices,
            directory,
            assignments,
            planner,
        }
    }

    /// Create a pending assignment and lock its orders
    pub async fn create(
        &self,
        operator_id: &str,
        drone_id: &str,
        order_ids: Vec<String>,
        hints: RouteHints,
    ) -> Result<Assignment, SchedulerError> {
        let visit_order = visit_order(&order_ids, hints.order_sequence)?;

        if self.directory.find_operator(operator_id).await?.is_none() {
            return Err(SchedulerError::InvalidAssignment(format!(
                "unknown operator {operator_id}"
            )));
        }

        let drone = self.devices.get_device(drone_id).await?.ok_or_else(|| {
            SchedulerError::InvalidAssignment(format!("unknown drone {drone_id}"))
        })?;

        let mut destinations = Vec::with_capacity(visit_order.len());
        for order_id in visit_order {
            let order = self.directory.find_order(&order_id).await?.ok_or_else(|| {
                SchedulerError::InvalidAssignment(format!("unknown order {order_id}"))
            })?;
            destinations.push((order_id, order.destination));
        }

        let scheduled_at_ms = hints.scheduled_at_ms.unwrap_or_else(now_ms);
        let origin = hints.origin.unwrap_or(drone.location);
        if !origin.is_valid() {
            return Err(SchedulerError::InvalidAssignment(
                "route origin out of range".into(),
            ));
        }
        let planned = self
            .planner
            .plan(origin, &destinations, scheduled_at_ms)
            .map_err(|e| SchedulerError::InvalidAssignment(format!("route: {e}")))?;

        let assignment = Assignment {
            assignment_id: Uuid::new_v4().to_string(),
            operator_id: operator_id.to_string(),
            drone_id: drone.device_id,
            order_ids: planned.stops.iter().map(|s| s.order_id.clone()).collect(),
            status: AssignmentStatus::Pending,
            scheduled_at_ms,
            started_at_ms: None,
            finished_at_ms: None,
            route: planned.stops,
            total_distance_km: planned.total_distance_km,
            estimated_duration_minutes: planned.estimated_duration_minutes,
        };

        if let Err(e) = self.assignments.insert_assignment(&assignment).await {
            warn!(operator_id, drone_id, "Assignment rejected by store: {}", e);
            return Err(e.into());
        }

        info!(
            assignment_id = %assignment.assignment_id,
            operator_id,
            drone_id,
            stops = assignment.route.len(),
            distance_km = assignment.total_distance_km,
            "Assignment created"
        );
        Ok(assignment)
    }

    /// `pending -> active`
    pub async fn start(&self, assignment_id: &str) -> Result<Assignment, SchedulerError> {
        self.transition(assignment_id, AssignmentEvent::Start).await
    }

    /// `active -> completed`, releasing the orders
    pub async fn complete(&self, assignment_id: &str) -> Result<Assignment, SchedulerError> {
        self.transition(assignment_id, AssignmentEvent::Complete).await
    }

    /// `pending | active -> cancelled`, releasing the orders
    pub async fn cancel(&self, assignment_id: &str) -> Result<Assignment, SchedulerError> {
        self.transition(assignment_id, AssignmentEvent::Cancel).await
    }

    pub async fn get(&self, assignment_id: &str) -> Result<Assignment, SchedulerError> {
        self.assignments
            .get_assignment(assignment_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(assignment_id.to_string()))
    }

    pub async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Assignment>, SchedulerError> {
        Ok(self.assignments.list_for_operator(operator_id).await?)
    }

    async fn transition(
        &self,
        assignment_id: &str,
        event: AssignmentEvent,
    ) -> Result<Assignment, SchedulerError> {
        match self.assignments.transition(assignment_id, event, now_ms()).await {
            Ok(assignment) => {
                info!(assignment_id, "Assignment {} -> {}", event, assignment.status);
                Ok(assignment)
            }
            Err(StoreError::StatusMismatch { id, actual }) => {
                warn!(assignment_id, "Refusing to {} assignment in state {}", event, actual);
                Err(SchedulerError::InvalidTransition {
                    id,
                    from: actual,
                    event,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Check the order set and resolve the visit order
fn visit_order(
    order_ids: &[String],
    sequence: Option<Vec<String>>,
) -> Result<Vec<String>, SchedulerError> {
    if order_ids.is_empty() {
        return Err(SchedulerError::InvalidAssignment("no orders given".into()));
    }

    let mut seen = HashSet::with_capacity(order_ids.len());
    for id in order_ids {
        if !seen.insert(id.as_str()) {
            return Err(SchedulerError::InvalidAssignment(format!(
                "order {id} listed twice"
            )));
        }
    }

    let Some(sequence) = sequence else {
        return Ok(order_ids.to_vec());
    };

    let hinted: HashSet<&str> = sequence.iter().map(String::as_str).collect();
    if sequence.len() != order_ids.len() || hinted != seen {
        return Err(SchedulerError::InvalidAssignment(
            "route hint is not a permutation of the orders".into(),
        ));
    }
    Ok(sequence)
}
