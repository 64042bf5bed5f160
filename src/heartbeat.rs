use crate::{
    api::{DeviceCommand, HeartbeatAck, ServerApi},
    auth::AuthManager,
    config::SharedConfig,
    config_sync::ConfigSyncClient,
    error::{EdgesyncError, Result},
    sync::SyncEngine,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type CommandHandler = Box<dyn Fn(&DeviceCommand) + Send + Sync>;

/// Consecutive failed heartbeats after which the device reports `error`
const FAILURE_THRESHOLD: u32 = 5;

/// Derive the device status string reported in a heartbeat.
/// Thresholds: cpu or memory above 90%, disk above 95%, or CPU temperature
/// above 75°C degrade the status to `warning`.
fn derive_status(
    consecutive_failures: u32,
    cpu_percent: f64,
    memory_percent: f64,
    disk_percent: f64,
    temperature: Option<f64>,
) -> &'static str {
    if consecutive_failures > FAILURE_THRESHOLD {
        return "error";
    }
    if cpu_percent > 90.0
        || memory_percent > 90.0
        || disk_percent > 95.0
        || temperature.map_or(false, |t| t > 75.0)
    {
        return "warning";
    }
    "online"
}

/// CPU temperature from the thermal zone sysfs node, if present
fn read_cpu_temperature() -> Option<f64> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    parse_millidegrees(raw.trim())
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    let millis: i64 = raw.parse().ok()?;
    Some((millis as f64 / 1000.0 * 10.0).round() / 10.0)
}

/// Periodically reports device health to the server and dispatches any
/// commands the server attaches to the acknowledgement.
pub struct HeartbeatService {
    live: SharedConfig,
    api: Arc<ServerApi>,
    auth: Arc<AuthManager>,
    config_sync: Arc<ConfigSyncClient>,
    engine: Arc<SyncEngine>,
    system: parking_lot::Mutex<System>,
    consecutive_failures: AtomicU32,
    handlers: parking_lot::RwLock<HashMap<String, CommandHandler>>,
}

impl HeartbeatService {
    pub fn new(
        live: SharedConfig,
        api: Arc<ServerApi>,
        auth: Arc<AuthManager>,
        config_sync: Arc<ConfigSyncClient>,
        engine: Arc<SyncEngine>,
    ) -> Self {
        Self {
            live,
            api,
            auth,
            config_sync,
            engine,
            system: parking_lot::Mutex::new(System::new()),
            consecutive_failures: AtomicU32::new(0),
            handlers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a server command type, replacing any existing
    /// handler for that type
    pub fn register_command_handler<F>(&self, command_type: &str, handler: F)
    where
        F: Fn(&DeviceCommand) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(command_type.to_string(), Box::new(handler));
    }

    /// Report loop: one heartbeat immediately on start, then on the interval
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.live.read().heartbeat.interval_seconds,
            "Heartbeat service started"
        );

        loop {
            match self.send_heartbeat().await {
                Ok(()) => debug!("Heartbeat acknowledged"),
                Err(e) => debug!("Heartbeat not delivered: {}", e),
            }

            let interval = Duration::from_secs(self.live.read().heartbeat.interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Heartbeat service stopped");
    }

    /// Send one heartbeat and process the server's acknowledgement
    pub async fn send_heartbeat(&self) -> Result<()> {
        let token = match self.auth.get_valid_token().await {
            Ok(token) => token,
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        let report = self.build_report().await;

        match self.api.send_heartbeat(&token, &report).await {
            Ok(ack) => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.process_ack(ack).await;
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                if matches!(e, EdgesyncError::Auth { .. }) {
                    self.auth.invalidate().await;
                }
                Err(e)
            }
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    async fn build_report(&self) -> Value {
        let (cpu_percent, cpu_count, memory_percent, memory_total_gb) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();

            let memory_total = system.total_memory();
            let memory_percent = if memory_total > 0 {
                system.used_memory() as f64 / memory_total as f64 * 100.0
            } else {
                0.0
            };
            (
                system.global_cpu_usage() as f64,
                system.cpus().len(),
                memory_percent,
                memory_total as f64 / (1024.0 * 1024.0 * 1024.0),
            )
        };

        let (disk_percent, disk_total_gb) = root_disk_usage();
        let temperature = read_cpu_temperature();

        let status = derive_status(
            self.failure_count(),
            cpu_percent,
            memory_percent,
            disk_percent,
            temperature,
        );

        let mut system_info = json!({
            "hostname": System::host_name(),
            "os": System::long_os_version(),
            "uptime_seconds": System::uptime(),
            "cpu_percent": (cpu_percent * 10.0).round() / 10.0,
            "cpu_count": cpu_count,
            "memory_percent": (memory_percent * 10.0).round() / 10.0,
            "memory_total_gb": (memory_total_gb * 100.0).round() / 100.0,
            "disk_percent": (disk_percent * 10.0).round() / 10.0,
            "disk_total_gb": disk_total_gb,
        });
        if let Some(temperature) = temperature {
            system_info["temperature"] = json!(temperature);
        }

        let performance = match self.engine.get_status().await {
            Ok(sync_status) => json!({
                "config_version": self.config_sync.current_version(),
                "pending_events": sync_status.pending_events,
                "synced_events": sync_status.synced_events,
                "sync_in_progress": sync_status.sync_in_progress,
                "last_sync": sync_status.last_sync,
            }),
            Err(e) => {
                warn!("Could not read sync status for heartbeat: {}", e);
                json!({ "config_version": self.config_sync.current_version() })
            }
        };

        let device_id = self.live.read().device.device_id.clone();
        json!({
            "device_id": device_id,
            "timestamp": Utc::now().to_rfc3339(),
            "status": status,
            "system_info": system_info,
            "performance": performance,
        })
    }

    async fn process_ack(&self, ack: HeartbeatAck) {
        if ack.config_pending {
            info!("Server signalled pending configuration, checking now");
            match self.config_sync.check_for_updates().await {
                Ok(true) => info!("Pending configuration applied"),
                Ok(false) => debug!("No newer configuration found"),
                Err(e) => warn!("Pending configuration check failed: {}", e),
            }
        }

        for command in &ack.commands {
            self.dispatch_command(command);
        }
    }

    fn dispatch_command(&self, command: &DeviceCommand) {
        let handlers = self.handlers.read();
        match handlers.get(&command.command_type) {
            Some(handler) => {
                info!(command = %command.command_type, "Executing server command");
                handler(command);
            }
            None => warn!(command = %command.command_type, "Unknown server command ignored"),
        }
    }
}

fn root_disk_usage() -> (f64, f64) {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());

    match root {
        Some(disk) if disk.total_space() > 0 => {
            let total = disk.total_space() as f64;
            let used = total - disk.available_space() as f64;
            (
                used / total * 100.0,
                ((total / (1024.0 * 1024.0 * 1024.0)) * 100.0).round() / 100.0,
            )
        }
        _ => (0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_online_when_healthy() {
        assert_eq!(derive_status(0, 20.0, 40.0, 50.0, Some(45.0)), "online");
        assert_eq!(derive_status(0, 20.0, 40.0, 50.0, None), "online");
    }

    #[test]
    fn test_status_warning_on_resource_pressure() {
        assert_eq!(derive_status(0, 95.0, 40.0, 50.0, None), "warning");
        assert_eq!(derive_status(0, 20.0, 91.0, 50.0, None), "warning");
        assert_eq!(derive_status(0, 20.0, 40.0, 96.0, None), "warning");
        assert_eq!(derive_status(0, 20.0, 40.0, 50.0, Some(80.0)), "warning");
    }

    #[test]
    fn test_status_error_after_repeated_failures() {
        // Six consecutive failures crosses the threshold
        assert_eq!(derive_status(6, 20.0, 40.0, 50.0, None), "error");
        // Exactly at the threshold is not an error yet
        assert_eq!(derive_status(5, 20.0, 40.0, 50.0, None), "online");
        // Failure status dominates resource warnings
        assert_eq!(derive_status(6, 95.0, 40.0, 50.0, None), "error");
    }

    #[test]
    fn test_boundary_thresholds_are_exclusive() {
        assert_eq!(derive_status(0, 90.0, 90.0, 95.0, Some(75.0)), "online");
    }

    #[test]
    fn test_parse_millidegrees() {
        assert_eq!(parse_millidegrees("47700"), Some(47.7));
        assert_eq!(parse_millidegrees("80000"), Some(80.0));
        assert_eq!(parse_millidegrees("not-a-number"), None);
    }
}
