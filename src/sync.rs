use crate::{
    api::{ServerApi, WireEvent},
    auth::AuthManager,
    config::SharedConfig,
    connectivity::ConnectivityMonitor,
    error::{EdgesyncError, Result},
    images::ImageStore,
    store::{BatchStatus, LocalEventStore, StoredEvent, SyncBatch},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one sync cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No connectivity; nothing attempted
    Offline,
    /// Another cycle (scheduled or forced) already holds the sync slot
    AlreadyRunning,
    /// Nothing pending
    Idle,
    /// One batch fully confirmed
    Completed { batch_id: String, event_count: usize },
}

/// Snapshot of the engine's externally visible state
#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_authenticated: bool,
    pub sync_in_progress: bool,
    pub pending_events: u64,
    pub synced_events: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Drives the batch upload protocol: select pending events, bind them to a
/// durable batch, send, upload snapshots best-effort, confirm, clean up.
///
/// At most one cycle runs at a time; the scheduled loop and `force_sync`
/// share the same exclusion flag. An unconfirmed batch left by a crash is
/// always resumed before any new events are batched, so the server sees the
/// same batch id and membership again rather than a reshuffled set.
pub struct SyncEngine {
    live: SharedConfig,
    store: Arc<LocalEventStore>,
    images: Arc<ImageStore>,
    api: Arc<ServerApi>,
    auth: Arc<AuthManager>,
    connectivity: Arc<ConnectivityMonitor>,
    in_progress: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        live: SharedConfig,
        store: Arc<LocalEventStore>,
        images: Arc<ImageStore>,
        api: Arc<ServerApi>,
        auth: Arc<AuthManager>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            live,
            store,
            images,
            api,
            auth,
            connectivity,
            in_progress: AtomicBool::new(false),
        }
    }

    // Settings come from the live configuration at each use so an applied
    // remote config takes effect on the next cycle
    fn retry_policy(&self) -> (u32, Duration) {
        let sync = &self.live.read().sync;
        (
            sync.retry_attempts.max(1),
            Duration::from_secs(sync.retry_delay_seconds),
        )
    }

    /// Scheduled sync loop
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Sync engine started");

        loop {
            match self.sync_pending_events().await {
                Ok(CycleOutcome::Completed { batch_id, event_count }) => {
                    info!(batch_id = %batch_id, events = event_count, "Sync cycle completed");
                }
                Ok(CycleOutcome::Offline) => debug!("Sync cycle skipped: offline"),
                Ok(CycleOutcome::AlreadyRunning) => {
                    debug!("Sync cycle skipped: another cycle in progress")
                }
                Ok(CycleOutcome::Idle) => debug!("Sync cycle idle: no pending events"),
                // Retryable failures wait for the next tick; the batch (if
                // any) stays durable and will be resumed
                Err(e) if e.is_retryable() => warn!("Sync cycle failed, will retry: {}", e),
                Err(e) => error!("Sync cycle failed: {}", e),
            }

            let interval = Duration::from_secs(self.live.read().sync.sync_interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Sync engine stopped");
    }

    /// Run one cycle immediately (shares the exclusion slot with the
    /// scheduled loop)
    pub async fn force_sync(&self) -> Result<CycleOutcome> {
        self.sync_pending_events().await
    }

    /// One protocol cycle, guarded so concurrent callers cannot overlap
    pub async fn sync_pending_events(&self) -> Result<CycleOutcome> {
        if !self.try_begin() {
            return Ok(CycleOutcome::AlreadyRunning);
        }

        let result = self.run_cycle().await;
        self.finish();
        result
    }

    fn try_begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    async fn run_cycle(&self) -> Result<CycleOutcome> {
        if !self.connectivity.is_online().await {
            return Ok(CycleOutcome::Offline);
        }

        // Crash recovery comes first: finish what was started before
        // binding any new events to a batch
        if let Some(batch) = self.store.get_oldest_unconfirmed_batch().await? {
            return self.resume_batch(batch).await;
        }

        let batch_size = self.live.read().sync.batch_size;
        let events = self.store.get_pending_events(batch_size).await?;
        if events.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let event_ids: Vec<String> = events.iter().map(|e| e.local_id.clone()).collect();
        // The batch is durable before any network traffic; a crash from here
        // on is recovered by re-sending the identical batch
        let batch_id = self.store.create_sync_batch(&event_ids).await?;

        self.send_and_confirm(&batch_id, &events).await?;
        Ok(CycleOutcome::Completed {
            batch_id,
            event_count: events.len(),
        })
    }

    async fn resume_batch(&self, batch: SyncBatch) -> Result<CycleOutcome> {
        let events = self.store.get_batch_events(&batch.id).await?;
        info!(
            batch_id = %batch.id,
            status = batch.status.as_str(),
            events = events.len(),
            "Resuming unconfirmed batch"
        );

        match batch.status {
            // Never known to have reached the server: replay from the send
            // phase with the original id and membership
            BatchStatus::Pending => self.send_and_confirm(&batch.id, &events).await?,
            // The send went through; only the confirmation is outstanding
            BatchStatus::Sent => self.confirm_and_finalize(&batch.id).await?,
            BatchStatus::Confirmed => {
                // Not reachable via get_oldest_unconfirmed_batch
                warn!(batch_id = %batch.id, "Confirmed batch returned as unconfirmed");
            }
        }

        Ok(CycleOutcome::Completed {
            batch_id: batch.id,
            event_count: events.len(),
        })
    }

    async fn send_and_confirm(&self, batch_id: &str, events: &[StoredEvent]) -> Result<()> {
        let wire: Vec<WireEvent> = events.iter().map(WireEvent::from_stored).collect();

        let (retry_attempts, retry_delay) = self.retry_policy();
        let mut token = self.auth.get_valid_token().await?;
        let mut attempt = 0;
        let ack = loop {
            attempt += 1;
            match self.api.send_batch(&token, batch_id, &wire).await {
                Ok(ack) => break ack,
                Err(EdgesyncError::Auth { message }) if attempt < retry_attempts => {
                    warn!("Token rejected during batch send: {}", message);
                    self.auth.invalidate().await;
                    token = self.auth.get_valid_token().await?;
                }
                Err(e) if e.is_retryable() && attempt < retry_attempts => {
                    warn!(batch_id = %batch_id, attempt = attempt, "Batch send failed: {}", e);
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.store.mark_batch_sent(batch_id).await?;
        debug!(batch_id = %batch_id, "Batch sent");

        // Snapshots are tagged with the id the server assigned in the ack,
        // not the device-local id
        let server_ids: HashMap<String, String> = ack
            .events
            .into_iter()
            .filter_map(|e| e.server_id.map(|server_id| (e.local_id, server_id)))
            .collect();

        self.upload_images(&token, events, &server_ids).await;
        self.confirm_and_finalize(batch_id).await
    }

    // Snapshot uploads never fail the cycle; the event record itself is the
    // durable part and the image stays on disk until retention evicts it
    async fn upload_images(
        &self,
        token: &str,
        events: &[StoredEvent],
        server_ids: &HashMap<String, String>,
    ) {
        for event in events {
            let Some(image_path) = event.image_path.as_deref() else {
                continue;
            };

            let Some(server_id) = server_ids.get(&event.local_id) else {
                warn!(
                    local_id = %event.local_id,
                    "Server assigned no event id, skipping snapshot upload"
                );
                continue;
            };

            let path = Path::new(image_path);
            let data = match self.images.load_image(path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(local_id = %event.local_id, "Snapshot unreadable, skipping upload: {}", e);
                    continue;
                }
            };

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("{}.jpg", event.local_id));

            if let Err(e) = self
                .api
                .upload_image(token, server_id, &file_name, data)
                .await
            {
                warn!(local_id = %event.local_id, server_id = %server_id, "Snapshot upload failed: {}", e);
            }
        }
    }

    async fn confirm_and_finalize(&self, batch_id: &str) -> Result<()> {
        let (retry_attempts, retry_delay) = self.retry_policy();
        let mut token = self.auth.get_valid_token().await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.confirm_batch(&token, batch_id).await {
                Ok(()) => break,
                Err(EdgesyncError::Auth { message }) if attempt < retry_attempts => {
                    warn!("Token rejected during batch confirm: {}", message);
                    self.auth.invalidate().await;
                    token = self.auth.get_valid_token().await?;
                }
                Err(e) if e.is_retryable() && attempt < retry_attempts => {
                    warn!(batch_id = %batch_id, attempt = attempt, "Batch confirm failed: {}", e);
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.store.mark_batch_confirmed(batch_id).await?;
        self.store.update_last_sync_time().await?;

        if let Err(e) = self.store.cleanup_old_events().await {
            warn!("Event retention cleanup failed: {}", e);
        }
        if let Err(e) = self.images.cleanup_old_images().await {
            warn!("Image retention cleanup failed: {}", e);
        }

        Ok(())
    }

    /// Externally visible engine state, for heartbeats and the CLI
    pub async fn get_status(&self) -> Result<SyncStatus> {
        let connection = self.store.get_connection_status().await?;
        Ok(SyncStatus {
            is_online: self.connectivity.last_known_online(),
            is_authenticated: self.auth.is_authenticated().await,
            sync_in_progress: self.in_progress.load(Ordering::Acquire),
            pending_events: self.store.count_pending_events().await?,
            synced_events: self.store.count_synced_events().await?,
            last_sync: connection.last_sync,
        })
    }
}
