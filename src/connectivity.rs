use crate::{
    api::ServerApi,
    auth::AuthManager,
    config::SharedConfig,
    error::Result,
    store::LocalEventStore,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a layered connectivity test: each layer is only probed when
/// the one below it passed.
#[derive(Debug, Default, Serialize)]
pub struct ConnectivityReport {
    pub internet: bool,
    pub server: bool,
    pub authentication: bool,
}

/// Periodically probes a well-known endpoint to track whether the appliance
/// is online, records transitions in the store, and triggers authentication
/// as soon as connectivity returns.
pub struct ConnectivityMonitor {
    live: SharedConfig,
    probe_client: reqwest::Client,
    store: Arc<LocalEventStore>,
    auth: Arc<AuthManager>,
    api: Arc<ServerApi>,
    online: AtomicBool,
}

impl ConnectivityMonitor {
    pub fn new(
        live: SharedConfig,
        store: Arc<LocalEventStore>,
        auth: Arc<AuthManager>,
        api: Arc<ServerApi>,
    ) -> Result<Self> {
        // The probe timeout is baked into the client; probe URL and check
        // interval are re-read from the live configuration at each use
        let probe_timeout = live.read().connection.probe_timeout_seconds;
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(probe_timeout))
            .build()?;

        Ok(Self {
            live,
            probe_client,
            store,
            auth,
            api,
            online: AtomicBool::new(false),
        })
    }

    /// Last probed state, without touching the network
    pub fn last_known_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// On-demand internet probe
    pub async fn is_online(&self) -> bool {
        self.check_connection().await
    }

    async fn check_connection(&self) -> bool {
        let probe_url = self.live.read().connection.probe_url.clone();
        match self.probe_client.get(&probe_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }

    /// Layered diagnostic: internet reachability, then server reachability,
    /// then authentication. Used by status reporting and the CLI dry run.
    pub async fn test_full_connectivity(&self) -> ConnectivityReport {
        let mut report = ConnectivityReport::default();

        report.internet = self.check_connection().await;
        if !report.internet {
            return report;
        }

        report.server = self.api.check_server_reachable().await;
        if !report.server {
            return report;
        }

        report.authentication = self.auth.get_valid_token().await.is_ok();
        report
    }

    /// Monitor loop: probe, persist the observed state, and on every online
    /// observation make sure a token is held so the next sync cycle does not
    /// pay the authentication round trip.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        {
            let connection = &self.live.read().connection;
            info!(
                interval_secs = connection.check_interval_seconds,
                probe_url = %connection.probe_url,
                "Connectivity monitor started"
            );
        }

        loop {
            let was_online = self.online.load(Ordering::Relaxed);
            let now_online = self.check_connection().await;
            self.online.store(now_online, Ordering::Relaxed);

            if let Err(e) = self.store.update_connection_status(now_online).await {
                warn!("Could not record connection status: {}", e);
            }

            if now_online && !was_online {
                info!("Connectivity restored");
            } else if !now_online && was_online {
                warn!("Connectivity lost");
            }

            if now_online && !self.auth.is_authenticated().await {
                match self.auth.get_valid_token().await {
                    Ok(_) => debug!("Token refreshed by connectivity monitor"),
                    // The auth throttle makes this a quiet retry, not a loop
                    Err(e) => debug!("Authentication not available yet: {}", e),
                }
            }

            let interval =
                Duration::from_secs(self.live.read().connection.check_interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Connectivity monitor stopped");
    }
}
