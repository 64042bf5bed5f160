pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod config_sync;
pub mod connectivity;
pub mod error;
pub mod heartbeat;
pub mod images;
pub mod ingest;
pub mod store;
pub mod sync;

pub use api::{AuthGrant, DeviceCommand, HeartbeatAck, RemoteConfig, ServerApi, WireEvent};
pub use app::EdgesyncAgent;
pub use auth::AuthManager;
pub use config::{EdgesyncConfig, SharedConfig};
pub use config_sync::ConfigSyncClient;
pub use connectivity::{ConnectivityMonitor, ConnectivityReport};
pub use error::{EdgesyncError, Result};
pub use heartbeat::HeartbeatService;
pub use images::ImageStore;
pub use ingest::{CleanupReport, EventIngest, StorageStats};
pub use store::{BatchStatus, ConnectionRecord, LocalEventStore, StoredEvent, SyncBatch};
pub use sync::{CycleOutcome, SyncEngine, SyncStatus};
