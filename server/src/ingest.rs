//! Location ingestion pipeline
//!
//! Turns untrusted telemetry into device state: validate, upsert, broadcast.
//! Reports are fire-and-forget; nothing here ever answers the reporting
//! channel. Rejections and store failures are only visible to the
//! [`ReportObserver`] and the logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleetsync_shared::{limits, now_ms, LocationReport, LocationUpdate};
use tracing::{debug, error, warn};

use crate::error::{IngestError, InvalidReport, StoreError};
use crate::fanout::{Fanout, FanoutReport};
use crate::store::{DeviceRecord, DeviceStore, LocationFix};

/// Observability sink for the ingestion path
pub trait ReportObserver: Send + Sync {
    fn report_accepted(&self, record: &DeviceRecord, fanout: FanoutReport);

    fn report_rejected(&self, report: &LocationReport, reason: &InvalidReport);

    fn store_failed(&self, device_id: &str, error: &StoreError);
}

/// Counter snapshot from [`TracingObserver`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub store_failures: u64,
}

/// Default observer: structured log lines plus running counters
#[derive(Default)]
pub struct TracingObserver {
    accepted: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> IngestCounts {
        IngestCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

impl ReportObserver for TracingObserver {
    fn report_accepted(&self, record: &DeviceRecord, fanout: FanoutReport) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(
            device_id = %record.device_id,
            battery = record.battery_level,
            delivered = fanout.delivered,
            dropped = fanout.dropped,
            "Location applied"
        );
    }

    fn report_rejected(&self, report: &LocationReport, reason: &InvalidReport) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(device_id = %report.device_id, "Discarding location report: {}", reason);
    }

    fn store_failed(&self, device_id: &str, error: &StoreError) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        error!(device_id = %device_id, "Location upsert failed: {}", error);
    }
}

/// Check a raw report and turn it into a fix stamped with `received_at_ms`
pub fn validate(report: &LocationReport, received_at_ms: u64) -> Result<LocationFix, InvalidReport> {
    let device_id = report.device_id.trim();
    if device_id.is_empty() {
        return Err(InvalidReport::EmptyDeviceId);
    }

    let battery = report.battery_level;
    if !battery.is_finite() || !(limits::BATTERY_MIN..=limits::BATTERY_MAX).contains(&battery) {
        return Err(InvalidReport::BatteryOutOfRange(battery));
    }

    let location = report.location.ok_or(InvalidReport::MissingLocation)?;
    if !location.is_valid() {
        return Err(InvalidReport::LocationOutOfRange {
            latitude: location.latitude,
            longitude: location.longitude,
        });
    }

    Ok(LocationFix {
        device_id: device_id.to_string(),
        location,
        battery_level: battery,
        received_at_ms,
    })
}

pub struct LocationIngestor {
    store: Arc<dyn DeviceStore>,
    fanout: Arc<Fanout>,
    observer: Arc<dyn ReportObserver>,
}

impl LocationIngestor {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        fanout: Arc<Fanout>,
        observer: Arc<dyn ReportObserver>,
    ) -> Self {
        Self {
            store,
            fanout,
            observer,
        }
    }

    /// Apply one report and broadcast the result
    ///
    /// The error is for the caller's logs only; it must not be relayed to the
    /// reporting channel.
    pub async fn ingest(&self, report: LocationReport) -> Result<DeviceRecord, IngestError> {
        let fix = match validate(&report, now_ms()) {
            Ok(fix) => fix,
            Err(reason) => {
                self.observer.report_rejected(&report, &reason);
                return Err(reason.into());
            }
        };

        let device_id = fix.device_id.clone();
        let record = match self.store.upsert_location(fix).await {
            Ok(record) => record,
            Err(e) => {
                self.observer.store_failed(&device_id, &e);
                return Err(e.into());
            }
        };

        let fanout = self
            .fanout
            .publish(LocationUpdate {
                device_id: record.device_id.clone(),
                location: Some(record.location),
                battery_level: record.battery_level,
                display_name: record.display_name.clone(),
            })
            .await;

        self.observer.report_accepted(&record, fanout);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::session::{ChannelHandle, ConnectionRegistry};
    use crate::store::{DeviceStatus, MemoryStore};
    use async_trait::async_trait;
    use fleetsync_shared::{GeoPoint, Role};

    fn report(device_id: &str, lat: f64, lon: f64, battery: f64) -> LocationReport {
        LocationReport {
            device_id: device_id.into(),
            location: Some(GeoPoint::new(lat, lon)),
            battery_level: battery,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        observer: Arc<TracingObserver>,
        ingestor: LocationIngestor,
        rx: tokio::sync::mpsc::Receiver<bytes::Bytes>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (viewer, rx) = ChannelHandle::new(
            "127.0.0.1:1".parse().expect("addr"),
            Principal::new("viewer", Role::Viewer),
            16,
        );
        registry.join("viewer", viewer).await;

        let observer = Arc::new(TracingObserver::new());
        let ingestor = LocationIngestor::new(
            store.clone(),
            Arc::new(Fanout::new(registry)),
            observer.clone(),
        );
        Harness {
            store,
            observer,
            ingestor,
            rx,
        }
    }

    #[test]
    fn test_validate_rules() {
        assert!(validate(&report("D1", 10.0, 20.0, 0.0), 1).is_ok());
        assert!(validate(&report("D1", 10.0, 20.0, 100.0), 1).is_ok());

        assert_eq!(
            validate(&report("  ", 10.0, 20.0, 50.0), 1),
            Err(InvalidReport::EmptyDeviceId)
        );
        assert_eq!(
            validate(&report("D1", 10.0, 20.0, 150.0), 1),
            Err(InvalidReport::BatteryOutOfRange(150.0))
        );
        assert_eq!(
            validate(&report("D1", 10.0, 20.0, -1.0), 1),
            Err(InvalidReport::BatteryOutOfRange(-1.0))
        );
        assert_eq!(
            validate(&report("D1", 91.0, 20.0, 50.0), 1),
            Err(InvalidReport::LocationOutOfRange {
                latitude: 91.0,
                longitude: 20.0
            })
        );

        let no_location = LocationReport {
            device_id: "D1".into(),
            location: None,
            battery_level: 10.0,
        };
        assert_eq!(validate(&no_location, 1), Err(InvalidReport::MissingLocation));
    }

    #[test]
    fn test_nan_battery_rejected() {
        assert!(matches!(
            validate(&report("D1", 0.0, 0.0, f64::NAN), 1),
            Err(InvalidReport::BatteryOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_battery_changes_nothing_and_broadcasts_nothing() {
        let mut h = harness().await;

        let err = h
            .ingestor
            .ingest(report("D1", 10.0, 20.0, 150.0))
            .await
            .expect_err("battery out of range");
        assert!(matches!(err, IngestError::Invalid(InvalidReport::BatteryOutOfRange(_))));

        assert!(h.store.get_device("D1").await.expect("get").is_none());
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.observer.counts().rejected, 1);
    }

    #[tokio::test]
    async fn test_existing_device_keeps_display_name() {
        let mut h = harness().await;
        h.store
            .provision_device("D1", "Harrier", GeoPoint::new(0.0, 0.0), DeviceStatus::Available)
            .await
            .expect("provision");

        let record = h
            .ingestor
            .ingest(report("D1", 45.0, 7.0, 64.0))
            .await
            .expect("ingest");
        assert_eq!(record.display_name, "Harrier");
        assert_eq!(record.status, DeviceStatus::Active);
        assert_eq!(record.location, GeoPoint::new(45.0, 7.0));
        assert_eq!(record.battery_level, 64.0);

        let frame = h.rx.recv().await.expect("broadcast");
        let mut buf = bytes::BytesMut::from(&frame[..]);
        let envelope = fleetsync_shared::codec::decode(&mut buf)
            .expect("decode")
            .expect("frame");
        match envelope.payload {
            Some(fleetsync_shared::envelope::Payload::LocationUpdate(update)) => {
                assert_eq!(update.device_id, "D1");
                assert_eq!(update.display_name, "Harrier");
                assert_eq!(update.battery_level, 64.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(h.observer.counts().accepted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_reports_yield_one_record() {
        let h = harness().await;
        let ingestor = Arc::new(h.ingestor);

        let a = {
            let ingestor = ingestor.clone();
            tokio::spawn(async move { ingestor.ingest(report("FRESH", 1.0, 1.0, 90.0)).await })
        };
        let b = {
            let ingestor = ingestor.clone();
            tokio::spawn(async move { ingestor.ingest(report("FRESH", 1.1, 1.1, 89.0)).await })
        };
        a.await.expect("join").expect("ingest a");
        b.await.expect("join").expect("ingest b");

        let devices = h.store.list_devices().await.expect("list");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].display_name, "Drone FRESH");
    }

    struct BrokenStore;

    #[async_trait]
    impl DeviceStore for BrokenStore {
        async fn upsert_location(&self, _fix: LocationFix) -> Result<DeviceRecord, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn provision_device(
            &self,
            _device_id: &str,
            _display_name: &str,
            _location: GeoPoint,
            _status: DeviceStatus,
        ) -> Result<DeviceRecord, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn get_device(&self, _device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_observed_not_broadcast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (viewer, mut rx) = ChannelHandle::new(
            "127.0.0.1:1".parse().expect("addr"),
            Principal::new("viewer", Role::Viewer),
            4,
        );
        registry.join("viewer", viewer).await;
        let observer = Arc::new(TracingObserver::new());
        let ingestor = LocationIngestor::new(
            Arc::new(BrokenStore),
            Arc::new(Fanout::new(registry)),
            observer.clone(),
        );

        let err = ingestor
            .ingest(report("D1", 1.0, 1.0, 50.0))
            .await
            .expect_err("store down");
        assert!(matches!(err, IngestError::Store(StoreError::Unavailable(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            observer.counts(),
            IngestCounts {
                accepted: 0,
                rejected: 0,
                store_failures: 1
            }
        );
    }
}
