//! In-process store backend

use std::collections::HashMap;

use async_trait::async_trait;
use fleetsync_shared::state_machine::AssignmentEvent;
use fleetsync_shared::GeoPoint;
use tokio::sync::{Mutex, RwLock};

use super::{
    default_display_name, Assignment, AssignmentStore, DeviceRecord, DeviceStatus, DeviceStore,
    Directory, LocationFix, Operator, Order,
};
use crate::error::StoreError;

#[derive(Default)]
struct AssignmentTables {
    assignments: HashMap<String, Assignment>,
    /// order_id -> assignment_id for every non-terminal assignment
    order_locks: HashMap<String, String>,
}

/// Store backed by maps in process memory
///
/// Each operation holds exactly one lock for its whole read-modify-write,
/// which is what makes upsert and order locking atomic here.
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    operators: RwLock<HashMap<String, Operator>>,
    orders: RwLock<HashMap<String, Order>>,
    assignments: Mutex<AssignmentTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_location(&self, fix: LocationFix) -> Result<DeviceRecord, StoreError> {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(fix.device_id.clone())
            .and_modify(|record| {
                record.location = fix.location;
                record.battery_level = fix.battery_level;
                record.status = DeviceStatus::Active;
                record.updated_at_ms = fix.received_at_ms;
            })
            .or_insert_with(|| DeviceRecord {
                display_name: default_display_name(&fix.device_id),
                device_id: fix.device_id.clone(),
                location: fix.location,
                battery_level: fix.battery_level,
                status: DeviceStatus::Active,
                updated_at_ms: fix.received_at_ms,
            });
        Ok(record.clone())
    }

    async fn provision_device(
        &self,
        device_id: &str,
        display_name: &str,
        location: GeoPoint,
        status: DeviceStatus,
    ) -> Result<DeviceRecord, StoreError> {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.to_string(),
                display_name: display_name.to_string(),
                location,
                battery_level: 100.0,
                status,
                updated_at_ms: fleetsync_shared::now_ms(),
            });
        Ok(record.clone())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let mut devices: Vec<DeviceRecord> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn find_operator(&self, operator_id: &str) -> Result<Option<Operator>, StoreError> {
        Ok(self.operators.read().await.get(operator_id).cloned())
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn upsert_operator(&self, operator: Operator) -> Result<(), StoreError> {
        self.operators
            .write()
            .await
            .insert(operator.operator_id.clone(), operator);
        Ok(())
    }

    async fn upsert_order(&self, order: Order) -> Result<(), StoreError> {
        self.orders.write().await.insert(order.order_id.clone(), order);
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), StoreError> {
        let mut tables = self.assignments.lock().await;

        let locked: Vec<String> = assignment
            .order_ids
            .iter()
            .filter(|id| tables.order_locks.contains_key(*id))
            .cloned()
            .collect();
        if !locked.is_empty() {
            return Err(StoreError::OrdersLocked(locked));
        }

        if tables.assignments.contains_key(&assignment.assignment_id) {
            return Err(StoreError::Unavailable(format!(
                "duplicate assignment id {}",
                assignment.assignment_id
            )));
        }

        for order_id in &assignment.order_ids {
            tables
                .order_locks
                .insert(order_id.clone(), assignment.assignment_id.clone());
        }
        tables
            .assignments
            .insert(assignment.assignment_id.clone(), assignment.clone());
        Ok(())
    }

    async fn get_assignment(&self, assignment_id: &str) -> Result<Option<Assignment>, StoreError> {
        Ok(self.assignments.lock().await.assignments.get(assignment_id).cloned())
    }

    async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Assignment>, StoreError> {
        let tables = self.assignments.lock().await;
        let mut found: Vec<Assignment> = tables
            .assignments
            .values()
            .filter(|a| a.operator_id == operator_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.scheduled_at_ms, a.assignment_id.clone()));
        Ok(found)
    }

    async fn transition(
        &self,
        assignment_id: &str,
        event: AssignmentEvent,
        at_ms: u64,
    ) -> Result<Assignment, StoreError> {
        let mut guard = self.assignments.lock().await;
        let tables = &mut *guard;

        let assignment = tables
            .assignments
            .get_mut(assignment_id)
            .ok_or_else(|| StoreError::NotFound(assignment_id.to_string()))?;

        assignment.apply(event, at_ms)?;

        if !assignment.status.holds_orders() {
            tables
                .order_locks
                .retain(|_, holder| holder.as_str() != assignment_id);
        }

        Ok(assignment.clone())
    }

    async fn order_holder(&self, order_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.assignments.lock().await.order_locks.get(order_id).cloned())
    }
}
