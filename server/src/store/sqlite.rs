//! SQLite store backend
//!
//! `rusqlite` is synchronous, so every operation runs on the blocking pool and
//! never stalls channel tasks. Conditional writes rely on SQLite itself:
//! `ON CONFLICT DO UPDATE` for device upserts and an `order_locks` table with
//! the order id as primary key for assignment creation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetsync_shared::state_machine::{AssignmentEvent, AssignmentStatus};
use fleetsync_shared::GeoPoint;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{
    default_display_name, Assignment, AssignmentStore, DeviceRecord, DeviceStatus, DeviceStore,
    Directory, LocationFix, Operator, Order, RouteStop,
};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    battery_level REAL NOT NULL,
    status TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS operators (
    operator_id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS assignments (
    assignment_id TEXT PRIMARY KEY,
    operator_id TEXT NOT NULL,
    drone_id TEXT NOT NULL,
    status TEXT NOT NULL,
    scheduled_at_ms INTEGER NOT NULL,
    started_at_ms INTEGER,
    finished_at_ms INTEGER,
    total_distance_km REAL NOT NULL,
    estimated_duration_minutes INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignments_operator ON assignments(operator_id);
CREATE TABLE IF NOT EXISTS route_stops (
    assignment_id TEXT NOT NULL REFERENCES assignments(assignment_id),
    sequence_number INTEGER NOT NULL,
    order_id TEXT NOT NULL,
    estimated_arrival_ms INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    PRIMARY KEY (assignment_id, sequence_number)
);
CREATE TABLE IF NOT EXISTS order_locks (
    order_id TEXT PRIMARY KEY,
    assignment_id TEXT NOT NULL
);
";

const DEVICE_COLUMNS: &str =
    "device_id, display_name, latitude, longitude, battery_level, status, updated_at_ms";

const ASSIGNMENT_COLUMNS: &str = "assignment_id, operator_id, drone_id, status, scheduled_at_ms, \
     started_at_ms, finished_at_ms, total_distance_km, estimated_duration_minutes";

/// Store persisted in a single SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<(DeviceRecord, String)> {
    let status: String = row.get(5)?;
    let record = DeviceRecord {
        device_id: row.get(0)?,
        display_name: row.get(1)?,
        location: GeoPoint::new(row.get(2)?, row.get(3)?),
        battery_level: row.get(4)?,
        // Placeholder until the status text is parsed outside the row closure
        status: DeviceStatus::Active,
        updated_at_ms: row.get::<_, i64>(6)? as u64,
    };
    Ok((record, status))
}

fn finish_device((mut record, status): (DeviceRecord, String)) -> Result<DeviceRecord, StoreError> {
    record.status = status.parse()?;
    Ok(record)
}

fn load_device(conn: &Connection, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1");
    conn.query_row(&sql, params![device_id], device_from_row)
        .optional()?
        .map(finish_device)
        .transpose()
}

struct AssignmentRow {
    assignment: Assignment,
    status: String,
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok(AssignmentRow {
        assignment: Assignment {
            assignment_id: row.get(0)?,
            operator_id: row.get(1)?,
            drone_id: row.get(2)?,
            order_ids: Vec::new(),
            status: AssignmentStatus::Pending,
            scheduled_at_ms: row.get::<_, i64>(4)? as u64,
            started_at_ms: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
            finished_at_ms: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
            route: Vec::new(),
            total_distance_km: row.get(7)?,
            estimated_duration_minutes: row.get::<_, i64>(8)? as u32,
        },
        status: row.get(3)?,
    })
}

fn load_route(conn: &Connection, assignment_id: &str) -> Result<Vec<RouteStop>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT order_id, sequence_number, estimated_arrival_ms, latitude, longitude
         FROM route_stops WHERE assignment_id = ?1 ORDER BY sequence_number",
    )?;
    let stops = stmt
        .query_map(params![assignment_id], |row| {
            Ok(RouteStop {
                order_id: row.get(0)?,
                sequence_number: row.get::<_, i64>(1)? as u32,
                estimated_arrival_ms: row.get::<_, i64>(2)? as u64,
                location: GeoPoint::new(row.get(3)?, row.get(4)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stops)
}

fn finish_assignment(conn: &Connection, row: AssignmentRow) -> Result<Assignment, StoreError> {
    let mut assignment = row.assignment;
    assignment.status = row
        .status
        .parse()
        .map_err(|e| StoreError::Unavailable(format!("corrupt assignment row: {e}")))?;
    assignment.route = load_route(conn, &assignment.assignment_id)?;
    assignment.order_ids = assignment
        .route
        .iter()
        .map(|stop| stop.order_id.clone())
        .collect();
    Ok(assignment)
}

fn load_assignment(conn: &Connection, assignment_id: &str) -> Result<Option<Assignment>, StoreError> {
    let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE assignment_id = ?1");
    match conn
        .query_row(&sql, params![assignment_id], assignment_from_row)
        .optional()?
    {
        Some(row) => finish_assignment(conn, row).map(Some),
        None => Ok(None),
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn upsert_location(&self, fix: LocationFix) -> Result<DeviceRecord, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO devices ({DEVICE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)
                 ON CONFLICT(device_id) DO UPDATE SET
                     latitude = excluded.latitude,
                     longitude = excluded.longitude,
                     battery_level = excluded.battery_level,
                     status = 'active',
                     updated_at_ms = excluded.updated_at_ms
                 RETURNING {DEVICE_COLUMNS}"
            );
            let row = conn.query_row(
                &sql,
                params![
                    fix.device_id,
                    default_display_name(&fix.device_id),
                    fix.location.latitude,
                    fix.location.longitude,
                    fix.battery_level,
                    fix.received_at_ms as i64,
                ],
                device_from_row,
            )?;
            finish_device(row)
        })
        .await
    }

    async fn provision_device(
        &self,
        device_id: &str,
        display_name: &str,
        location: GeoPoint,
        status: DeviceStatus,
    ) -> Result<DeviceRecord, StoreError> {
        let device_id = device_id.to_string();
        let display_name = display_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO devices ({DEVICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, 100.0, ?5, ?6)
                     ON CONFLICT(device_id) DO NOTHING"
                ),
                params![
                    device_id,
                    display_name,
                    location.latitude,
                    location.longitude,
                    status.as_str(),
                    fleetsync_shared::now_ms() as i64,
                ],
            )?;
            load_device(conn, &device_id)?
                .ok_or_else(|| StoreError::Unavailable(format!("device {device_id} vanished")))
        })
        .await
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| load_device(conn, &device_id)).await
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY device_id"
            ))?;
            let rows = stmt
                .query_map([], device_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(finish_device).collect()
        })
        .await
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn find_operator(&self, operator_id: &str) -> Result<Option<Operator>, StoreError> {
        let operator_id = operator_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT operator_id, name FROM operators WHERE operator_id = ?1",
                    params![operator_id],
                    |row| {
                        Ok(Operator {
                            operator_id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT order_id, latitude, longitude FROM orders WHERE order_id = ?1",
                    params![order_id],
                    |row| {
                        Ok(Order {
                            order_id: row.get(0)?,
                            destination: GeoPoint::new(row.get(1)?, row.get(2)?),
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn upsert_operator(&self, operator: Operator) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO operators (operator_id, name) VALUES (?1, ?2)
                 ON CONFLICT(operator_id) DO UPDATE SET name = excluded.name",
                params![operator.operator_id, operator.name],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_order(&self, order: Order) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO orders (order_id, latitude, longitude) VALUES (?1, ?2, ?3)
                 ON CONFLICT(order_id) DO UPDATE SET
                     latitude = excluded.latitude,
                     longitude = excluded.longitude",
                params![
                    order.order_id,
                    order.destination.latitude,
                    order.destination.longitude
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AssignmentStore for SqliteStore {
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), StoreError> {
        let assignment = assignment.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut locked = Vec::new();
            {
                let mut held =
                    tx.prepare_cached("SELECT 1 FROM order_locks WHERE order_id = ?1")?;
                for order_id in &assignment.order_ids {
                    if held.exists(params![order_id])? {
                        locked.push(order_id.clone());
                    }
                }
            }
            if !locked.is_empty() {
                // Dropping the transaction rolls it back
                return Err(StoreError::OrdersLocked(locked));
            }

            tx.execute(
                &format!(
                    "INSERT INTO assignments ({ASSIGNMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    assignment.assignment_id,
                    assignment.operator_id,
                    assignment.drone_id,
                    assignment.status.as_str(),
                    assignment.scheduled_at_ms as i64,
                    assignment.started_at_ms.map(|v| v as i64),
                    assignment.finished_at_ms.map(|v| v as i64),
                    assignment.total_distance_km,
                    assignment.estimated_duration_minutes as i64,
                ],
            )?;

            {
                let mut lock = tx.prepare_cached(
                    "INSERT INTO order_locks (order_id, assignment_id) VALUES (?1, ?2)",
                )?;
                let mut stop = tx.prepare_cached(
                    "INSERT INTO route_stops (assignment_id, sequence_number, order_id,
                         estimated_arrival_ms, latitude, longitude)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for order_id in &assignment.order_ids {
                    lock.execute(params![order_id, assignment.assignment_id])?;
                }
                for s in &assignment.route {
                    stop.execute(params![
                        assignment.assignment_id,
                        s.sequence_number as i64,
                        s.order_id,
                        s.estimated_arrival_ms as i64,
                        s.location.latitude,
                        s.location.longitude,
                    ])?;
                }
            }

            tx.commit()?;
            debug!(
                "Stored assignment {} with {} stops",
                assignment.assignment_id,
                assignment.route.len()
            );
            Ok(())
        })
        .await
    }

    async fn get_assignment(&self, assignment_id: &str) -> Result<Option<Assignment>, StoreError> {
        let assignment_id = assignment_id.to_string();
        self.with_conn(move |conn| load_assignment(conn, &assignment_id))
            .await
    }

    async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Assignment>, StoreError> {
        let operator_id = operator_id.to_string();
        self.with_conn(move |conn| {
            let conn: &Connection = conn;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
                 WHERE operator_id = ?1 ORDER BY scheduled_at_ms, assignment_id"
            ))?;
            let rows = stmt
                .query_map(params![operator_id], assignment_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|row| finish_assignment(conn, row))
                .collect()
        })
        .await
    }

    async fn transition(
        &self,
        assignment_id: &str,
        event: AssignmentEvent,
        at_ms: u64,
    ) -> Result<Assignment, StoreError> {
        let assignment_id = assignment_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut assignment = load_assignment(&tx, &assignment_id)?
                .ok_or_else(|| StoreError::NotFound(assignment_id.clone()))?;
            assignment.apply(event, at_ms)?;

            tx.execute(
                "UPDATE assignments SET status = ?1, started_at_ms = ?2, finished_at_ms = ?3
                 WHERE assignment_id = ?4",
                params![
                    assignment.status.as_str(),
                    assignment.started_at_ms.map(|ms| ms as i64),
                    assignment.finished_at_ms.map(|ms| ms as i64),
                    assignment_id
                ],
            )?;

            if !assignment.status.holds_orders() {
                tx.execute(
                    "DELETE FROM order_locks WHERE assignment_id = ?1",
                    params![assignment_id],
                )?;
            }

            tx.commit()?;
            Ok(assignment)
        })
        .await
    }

    async fn order_holder(&self, order_id: &str) -> Result<Option<String>, StoreError> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT assignment_id FROM order_locks WHERE order_id = ?1",
                    params![order_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{assignment, fix};

    #[tokio::test]
    async fn test_upsert_creates_then_updates_in_place() {
        let store = SqliteStore::open_in_memory().expect("open");

        let created = store
            .upsert_location(fix("D1", 1.0, 2.0, 80.0, 10))
            .await
            .expect("create");
        assert_eq!(created.display_name, "Drone D1");
        assert_eq!(created.status, DeviceStatus::Active);

        let updated = store
            .upsert_location(fix("D1", 3.0, 4.0, 79.5, 20))
            .await
            .expect("update");
        assert_eq!(updated.display_name, "Drone D1");
        assert_eq!(updated.location, GeoPoint::new(3.0, 4.0));
        assert_eq!(updated.battery_level, 79.5);
        assert_eq!(updated.updated_at_ms, 20);

        assert_eq!(store.list_devices().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_provision_does_not_clobber_reported_state() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .provision_device("D1", "Osprey", GeoPoint::new(0.0, 0.0), DeviceStatus::Maintenance)
            .await
            .expect("provision");
        store
            .upsert_location(fix("D1", 9.0, 9.0, 55.0, 30))
            .await
            .expect("report");

        let again = store
            .provision_device("D1", "Renamed", GeoPoint::new(1.0, 1.0), DeviceStatus::Charging)
            .await
            .expect("provision again");
        assert_eq!(again.display_name, "Osprey");
        assert_eq!(again.status, DeviceStatus::Active);
        assert_eq!(again.location, GeoPoint::new(9.0, 9.0));
    }

    #[tokio::test]
    async fn test_concurrent_first_reports_create_one_row() {
        let store = SqliteStore::open_in_memory().expect("open");

        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.upsert_location(fix("NEW", 1.0, 1.0, 50.0, i)).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("upsert");
        }

        assert_eq!(store.list_devices().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_assignment_round_trip_and_locking() {
        let store = SqliteStore::open_in_memory().expect("open");
        let original = assignment("a1", &["o1", "o2"]);
        store.insert_assignment(&original).await.expect("insert");

        let loaded = store.get_assignment("a1").await.expect("get").expect("exists");
        assert_eq!(loaded, original);

        let err = store
            .insert_assignment(&assignment("a2", &["o2"]))
            .await
            .expect_err("o2 locked");
        assert_eq!(err, StoreError::OrdersLocked(vec!["o2".into()]));
        assert!(store.get_assignment("a2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_assignment(&assignment("a1", &["o1"]))
            .await
            .expect("insert");

        let err = store
            .transition("a1", AssignmentEvent::Complete, 5)
            .await
            .expect_err("pending cannot complete");
        assert!(matches!(
            err,
            StoreError::StatusMismatch {
                actual: AssignmentStatus::Pending,
                ..
            }
        ));

        let cancelled = store
            .transition("a1", AssignmentEvent::Cancel, 6)
            .await
            .expect("cancel");
        assert_eq!(cancelled.status, AssignmentStatus::Cancelled);
        assert_eq!(cancelled.finished_at_ms, Some(6));
        assert_eq!(store.order_holder("o1").await.expect("holder"), None);

        // The released order can be assigned again
        store
            .insert_assignment(&assignment("a2", &["o1"]))
            .await
            .expect("reassign");
        assert_eq!(
            store.order_holder("o1").await.expect("holder"),
            Some("a2".into())
        );
    }

    #[tokio::test]
    async fn test_list_for_operator() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_assignment(&assignment("a1", &["o1"]))
            .await
            .expect("insert");
        store
            .insert_assignment(&assignment("a2", &["o2"]))
            .await
            .expect("insert");

        let listed = store.list_for_operator("op-1").await.expect("list");
        let ids: Vec<&str> = listed.iter().map(|a| a.assignment_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert!(store.list_for_operator("nobody").await.expect("list").is_empty());
    }
}
