//! FleetSync channel server
//!
//! Real-time synchronization core for a delivery fleet: authenticated
//! long-lived channels, the registry of who is online, location ingestion with
//! atomic auto-provisioning, best-effort broadcast fanout, and the assignment
//! scheduler that sequences orders onto an operator+drone pairing.

pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;

use std::sync::Arc;

pub use auth::{CredentialValidator, KeyRing, Principal, SignedTokenValidator, TokenIssuer};
pub use config::ServerConfig;
pub use error::{AuthError, IngestError, InvalidReport, SchedulerError, StoreError};
pub use fanout::{Fanout, FanoutReport};
pub use ingest::{LocationIngestor, ReportObserver, TracingObserver};
pub use scheduler::{AssignmentScheduler, RouteConfig, RouteHints, RoutePlanner};
pub use session::{ChannelHandle, ConnectionRegistry};
pub use store::{AssignmentStore, DeviceStore, Directory, MemoryStore, SqliteStore};

/// The wired-up core services sharing one store and one registry
#[derive(Clone)]
pub struct FleetServices {
    pub registry: Arc<ConnectionRegistry>,
    pub fanout: Arc<Fanout>,
    pub observer: Arc<TracingObserver>,
    pub ingestor: Arc<LocationIngestor>,
    pub scheduler: Arc<AssignmentScheduler>,
}

impl FleetServices {
    pub fn new<S>(store: Arc<S>, route: RouteConfig) -> Self
    where
        S: DeviceStore + Directory + AssignmentStore + 'static,
    {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Fanout::new(registry.clone()));
        let observer = Arc::new(TracingObserver::new());
        let ingestor = Arc::new(LocationIngestor::new(
            store.clone(),
            fanout.clone(),
            observer.clone(),
        ));
        let scheduler = Arc::new(AssignmentScheduler::new(
            store.clone(),
            store.clone(),
            store,
            RoutePlanner::new(route),
        ));

        Self {
            registry,
            fanout,
            observer,
            ingestor,
            scheduler,
        }
    }
}
