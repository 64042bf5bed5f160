use crate::{
    api::ServerApi,
    auth::AuthManager,
    config::{EdgesyncConfig, SharedConfig},
    config_sync::ConfigSyncClient,
    connectivity::{ConnectivityMonitor, ConnectivityReport},
    error::{EdgesyncError, Result},
    heartbeat::HeartbeatService,
    images::ImageStore,
    ingest::EventIngest,
    store::LocalEventStore,
    sync::SyncEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound on how long a worker may take to acknowledge cancellation
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level coordinator: wires the components together, runs the background
/// workers, and stops them in order on shutdown.
pub struct EdgesyncAgent {
    live: SharedConfig,
    store: Arc<LocalEventStore>,
    auth: Arc<AuthManager>,
    connectivity: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    config_sync: Arc<ConfigSyncClient>,
    heartbeat: Arc<HeartbeatService>,
    ingest: Arc<EventIngest>,
    cancellation_token: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl EdgesyncAgent {
    /// Construct every component without starting any background work
    pub async fn new(config: EdgesyncConfig, config_path: PathBuf) -> Result<Self> {
        let store = Arc::new(LocalEventStore::open(&config.storage, &config.sync).await?);
        let images = Arc::new(ImageStore::new(&config.storage));
        let api = Arc::new(ServerApi::new(&config)?);
        let auth = Arc::new(AuthManager::new(api.clone(), &config));

        // Single live-configuration handle shared by the workers; a remote
        // configuration apply swaps the value under the write lock and the
        // workers pick the new settings up at their next use
        let live = config.into_shared();

        let connectivity = Arc::new(ConnectivityMonitor::new(
            live.clone(),
            store.clone(),
            auth.clone(),
            api.clone(),
        )?);
        let engine = Arc::new(SyncEngine::new(
            live.clone(),
            store.clone(),
            images.clone(),
            api.clone(),
            auth.clone(),
            connectivity.clone(),
        ));
        let config_sync = Arc::new(ConfigSyncClient::new(
            live.clone(),
            config_path,
            api.clone(),
            auth.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            live.clone(),
            api,
            auth.clone(),
            config_sync.clone(),
            engine.clone(),
        ));
        let ingest = Arc::new(EventIngest::new(store.clone(), images));

        let agent = Self {
            live,
            store,
            auth,
            connectivity,
            engine,
            config_sync,
            heartbeat,
            ingest,
            cancellation_token: CancellationToken::new(),
            workers: Vec::new(),
        };
        agent.register_default_commands();

        info!("Agent components initialized");
        Ok(agent)
    }

    // Server commands the agent can act on itself. The embedding
    // application can override these or add its own (restart_detection is
    // expected to be handled by the detection host).
    fn register_default_commands(&self) {
        let config_sync = self.config_sync.clone();
        self.heartbeat
            .register_command_handler("force_config_sync", move |_| {
                let config_sync = config_sync.clone();
                tokio::spawn(async move {
                    match config_sync.check_for_updates().await {
                        Ok(true) => info!("Forced config sync applied a new version"),
                        Ok(false) => info!("Forced config sync found nothing new"),
                        Err(e) => warn!("Forced config sync failed: {}", e),
                    }
                });
            });

        let engine = self.engine.clone();
        self.heartbeat.register_command_handler("force_sync", move |_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.force_sync().await {
                    warn!("Forced sync failed: {}", e);
                }
            });
        });

        self.heartbeat
            .register_command_handler("update_log_level", |command| {
                let level = command
                    .params
                    .get("level")
                    .and_then(|v| v.as_str())
                    .unwrap_or("info");
                // The filter is fixed at startup; the new level takes effect
                // on the next restart
                warn!(level = %level, "Server requested log level change; restart to apply");
            });
    }

    /// Spawn all background workers
    pub fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            return Err(EdgesyncError::component("agent", "Agent already started"));
        }

        info!("Starting background workers");

        let connectivity = self.connectivity.clone();
        let token = self.cancellation_token.child_token();
        self.workers
            .push(("connectivity", tokio::spawn(connectivity.run(token))));

        let engine = self.engine.clone();
        let token = self.cancellation_token.child_token();
        self.workers.push(("sync", tokio::spawn(engine.run(token))));

        let config_sync = self.config_sync.clone();
        let token = self.cancellation_token.child_token();
        self.workers
            .push(("config_sync", tokio::spawn(config_sync.run(token))));

        let heartbeat = self.heartbeat.clone();
        let token = self.cancellation_token.child_token();
        self.workers
            .push(("heartbeat", tokio::spawn(heartbeat.run(token))));

        info!("All workers started");
        Ok(())
    }

    /// Block until a termination signal arrives, then shut down.
    /// Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        wait_for_shutdown_signal().await;
        self.shutdown().await
    }

    /// Cancel all workers and wait for each with a bounded timeout
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        self.cancellation_token.cancel();

        let mut exit_code = 0;
        for (name, handle) in self.workers.drain(..) {
            match timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("{} worker stopped", name),
                Ok(Err(e)) => {
                    error!("{} worker panicked: {}", name, e);
                    exit_code = 1;
                }
                Err(_) => {
                    error!("{} worker did not stop within {:?}", name, STOP_TIMEOUT);
                    exit_code = 1;
                }
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Event registration facade for the embedding application
    pub fn ingest(&self) -> Arc<EventIngest> {
        self.ingest.clone()
    }

    pub fn sync_engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    pub fn heartbeat(&self) -> Arc<HeartbeatService> {
        self.heartbeat.clone()
    }

    pub fn store(&self) -> Arc<LocalEventStore> {
        self.store.clone()
    }

    pub fn auth(&self) -> Arc<AuthManager> {
        self.auth.clone()
    }

    /// Current configuration as seen by the workers; reflects remotely
    /// applied versions without a restart
    pub fn live_config(&self) -> SharedConfig {
        self.live.clone()
    }

    /// Layered connectivity diagnostic (used by the CLI dry run)
    pub async fn test_connectivity(&self) -> ConnectivityReport {
        self.connectivity.test_full_connectivity().await
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn offline_config(dir: &TempDir) -> EdgesyncConfig {
        let mut config = EdgesyncConfig::default();
        config.device.device_id = "RPI_TEST0001".to_string();
        config.server.url = "http://127.0.0.1:9/api/v1".to_string();
        config.connection.probe_url = "http://127.0.0.1:9".to_string();
        config.connection.probe_timeout_seconds = 1;
        config.storage.db_path = dir.path().join("events.db").to_string_lossy().to_string();
        config.storage.image_path = dir.path().join("images").to_string_lossy().to_string();
        config.storage.token_path = dir.path().join(".token").to_string_lossy().to_string();
        config.config_sync.backup_dir = dir.path().join("backup").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_agent_starts_and_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir);
        let config_path = dir.path().join("edgesync.toml");

        let mut agent = EdgesyncAgent::new(config, config_path).await.unwrap();
        agent.start().unwrap();

        // Double start is rejected
        assert!(agent.start().is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let exit_code = agent.shutdown().await.unwrap();
        assert_eq!(exit_code, 0);
    }

    #[tokio::test]
    async fn test_agent_event_flow_while_offline() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir);
        let config_path = dir.path().join("edgesync.toml");

        let agent = EdgesyncAgent::new(config, config_path).await.unwrap();

        // The live handle exposes the configuration the workers run with
        assert_eq!(agent.live_config().read().device.device_id, "RPI_TEST0001");

        // Events captured while offline are held locally
        agent
            .ingest()
            .register_event(
                "fatigue",
                serde_json::json!({"level": 0.7}),
                None,
                Some("op-1"),
            )
            .await
            .unwrap();

        let status = agent.sync_engine().get_status().await.unwrap();
        assert_eq!(status.pending_events, 1);
        assert!(!status.is_online);
    }
}
