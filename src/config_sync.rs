use crate::{
    api::{RemoteConfig, ServerApi},
    auth::AuthManager,
    config::{EdgesyncConfig, SharedConfig},
    error::{EdgesyncError, Result},
};
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ChangeCallback = Box<dyn Fn(&toml::Value, &toml::Value) + Send + Sync>;

/// Value ranges the device refuses to run with, whatever the server says
const RANGE_CHECKS: &[(&str, &str, f64, f64)] = &[
    ("camera", "fps", 1.0, 60.0),
    ("camera", "width", 160.0, 1920.0),
    ("camera", "height", 120.0, 1080.0),
];

const REQUIRED_SECTIONS: &[&str] = &["camera", "system"];

/// Pulls versioned configuration from the server and applies it to the
/// device config file and the shared live handle.
///
/// Apply order is fixed: validate, back up the current file, merge the new
/// sections in, persist, swap the live configuration, then confirm to the
/// server. A persist failure rolls the file back from the backup just taken
/// and reports `config_error` instead. Versions only move forward; a
/// replayed older version is ignored.
pub struct ConfigSyncClient {
    api: Arc<ServerApi>,
    auth: Arc<AuthManager>,
    live: SharedConfig,
    config_path: PathBuf,
    current_version: AtomicI64,
    callbacks: parking_lot::Mutex<Vec<ChangeCallback>>,
}

impl ConfigSyncClient {
    pub fn new(
        live: SharedConfig,
        config_path: PathBuf,
        api: Arc<ServerApi>,
        auth: Arc<AuthManager>,
    ) -> Self {
        let current_version = read_local_version(&config_path).unwrap_or(1);
        debug!(version = current_version, "Local configuration version");

        Self {
            api,
            auth,
            live,
            config_path,
            current_version: AtomicI64::new(current_version),
            callbacks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked with (old, new) after a successful apply
    pub fn on_config_change<F>(&self, callback: F)
    where
        F: Fn(&toml::Value, &toml::Value) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    pub fn current_version(&self) -> i64 {
        self.current_version.load(Ordering::Acquire)
    }

    /// Poll loop. The interval is re-read from the live configuration each
    /// round so an applied change takes effect on the next wait.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Config sync client started");

        loop {
            let interval =
                Duration::from_secs(self.live.read().config_sync.check_interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }

            match self.check_for_updates().await {
                Ok(true) => info!("New configuration applied"),
                Ok(false) => debug!("Configuration up to date"),
                Err(e) if e.is_retryable() => debug!("Config check deferred: {}", e),
                Err(e) => error!("Config check failed: {}", e),
            }
        }

        info!("Config sync client stopped");
    }

    /// Ask the server for a newer configuration and apply it if one exists.
    /// Returns true when a new version was applied.
    pub async fn check_for_updates(&self) -> Result<bool> {
        let token = self.auth.get_valid_token().await?;
        let version = self.current_version();

        let Some(remote) = self.api.fetch_config(&token, version).await? else {
            return Ok(false);
        };

        if remote.config_version <= version {
            debug!(
                remote = remote.config_version,
                local = version,
                "Remote configuration is not newer"
            );
            return Ok(false);
        }

        match self.apply_remote_config(&remote).await {
            Ok(()) => {
                self.current_version
                    .store(remote.config_version, Ordering::Release);
                if let Err(e) = self
                    .api
                    .report_config_applied(&token, remote.config_version)
                    .await
                {
                    warn!("Could not confirm configuration apply: {}", e);
                }
                Ok(true)
            }
            Err(e) => {
                if let Err(report_err) = self
                    .api
                    .report_config_error(&token, &e.to_string(), Some(remote.config_version))
                    .await
                {
                    warn!("Could not report configuration error: {}", report_err);
                }
                Err(e)
            }
        }
    }

    async fn apply_remote_config(&self, remote: &RemoteConfig) -> Result<()> {
        validate_remote_config(&remote.config)?;

        let old = self.load_current().await?;
        let incoming = toml::Value::try_from(remote.config.clone()).map_err(|e| {
            EdgesyncError::validation(format!("Configuration is not representable: {}", e))
        })?;

        let mut merged = old.clone();
        merge_sections(&mut merged, &incoming);
        set_version(&mut merged, remote.config_version);

        // The merged document must still be a runnable agent configuration
        // before anything touches disk
        let typed: EdgesyncConfig = merged.clone().try_into().map_err(|e| {
            EdgesyncError::validation(format!("Merged configuration does not deserialize: {}", e))
        })?;
        typed
            .validate()
            .map_err(|e| EdgesyncError::validation(e.to_string()))?;

        let backup = self.backup_current_config().await?;

        if let Err(e) = self.persist(&merged).await {
            error!("Failed to persist configuration, rolling back: {}", e);
            if let Some(backup) = backup {
                if let Err(restore_err) = self.restore_backup(&backup).await {
                    error!("Rollback failed: {}", restore_err);
                }
            }
            return Err(e);
        }

        // Swap the live handle so running workers pick the new values up at
        // their next read
        *self.live.write() = typed;

        info!(version = remote.config_version, "Configuration applied");
        for callback in self.callbacks.lock().iter() {
            callback(&old, &merged);
        }
        Ok(())
    }

    async fn load_current(&self) -> Result<toml::Value> {
        match tokio::fs::read_to_string(&self.config_path).await {
            Ok(raw) => Ok(raw.parse::<toml::Value>()?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(toml::Value::Table(toml::map::Map::new()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, value: &toml::Value) -> Result<()> {
        let raw = toml::to_string_pretty(value)?;
        tokio::fs::write(&self.config_path, raw).await?;
        Ok(())
    }

    /// Copy the current config file into the backup directory with a
    /// timestamp suffix. Returns None when there is no file to back up yet.
    async fn backup_current_config(&self) -> Result<Option<PathBuf>> {
        if !self.config_path.exists() {
            return Ok(None);
        }

        let backup_dir = PathBuf::from(&self.live.read().config_sync.backup_dir);
        tokio::fs::create_dir_all(&backup_dir).await?;

        let file_name = self
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config.toml".to_string());
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup = backup_dir.join(format!("{}.backup_{}", file_name, timestamp));

        tokio::fs::copy(&self.config_path, &backup).await?;
        debug!(backup = %backup.display(), "Configuration backed up");
        Ok(Some(backup))
    }

    async fn restore_backup(&self, backup: &Path) -> Result<()> {
        tokio::fs::copy(backup, &self.config_path).await?;
        warn!(backup = %backup.display(), "Configuration restored from backup");
        Ok(())
    }

    /// Restore the newest backup on file. Exposed for the server's
    /// rollback command path.
    pub async fn rollback_to_newest_backup(&self) -> Result<()> {
        let backup_dir = PathBuf::from(&self.live.read().config_sync.backup_dir);
        let Some(backup) = newest_backup(&backup_dir).await? else {
            return Err(EdgesyncError::validation("No configuration backup exists"));
        };
        self.restore_backup(&backup).await
    }
}

/// Reject configurations that are structurally wrong or carry out-of-range
/// values for critical camera parameters
pub fn validate_remote_config(config: &Value) -> Result<()> {
    let Some(table) = config.as_object() else {
        return Err(EdgesyncError::validation(
            "Configuration must be a table of sections",
        ));
    };

    for section in REQUIRED_SECTIONS {
        if !table.contains_key(*section) {
            return Err(EdgesyncError::validation(format!(
                "Required section '{}' is missing",
                section
            )));
        }
    }

    for (section, key, min, max) in RANGE_CHECKS {
        let Some(value) = table.get(*section).and_then(|s| s.get(*key)) else {
            continue;
        };
        let Some(number) = value.as_f64() else {
            return Err(EdgesyncError::validation(format!(
                "{}.{} must be numeric, got {}",
                section, key, value
            )));
        };
        if number < *min || number > *max {
            return Err(EdgesyncError::validation(format!(
                "{}.{} out of range: {} (allowed {}..={})",
                section, key, number, min, max
            )));
        }
    }

    Ok(())
}

/// Merge incoming sections into the existing document. Keys inside a section
/// are updated individually; keys the server did not send are preserved.
pub fn merge_sections(existing: &mut toml::Value, incoming: &toml::Value) {
    let (Some(existing_table), Some(incoming_table)) =
        (existing.as_table_mut(), incoming.as_table())
    else {
        return;
    };

    for (section, values) in incoming_table {
        match (existing_table.get_mut(section), values.as_table()) {
            (Some(toml::Value::Table(current)), Some(new_values)) => {
                for (key, value) in new_values {
                    current.insert(key.clone(), value.clone());
                }
            }
            _ => {
                existing_table.insert(section.clone(), values.clone());
            }
        }
    }
}

fn set_version(document: &mut toml::Value, version: i64) {
    if let Some(table) = document.as_table_mut() {
        let system = table
            .entry("system".to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        if let Some(system) = system.as_table_mut() {
            system.insert("config_version".to_string(), toml::Value::Integer(version));
        }
    }
}

fn read_local_version(path: &Path) -> Option<i64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value: toml::Value = raw.parse().ok()?;
    value.get("system")?.get("config_version")?.as_integer()
}

/// Newest backup by file name; the timestamp suffix sorts lexicographically
async fn newest_backup(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<PathBuf> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if newest.as_ref().map_or(true, |n| path > *n) {
            newest = Some(path);
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_config() -> Value {
        json!({
            "camera": {"fps": 30, "width": 1280, "height": 720},
            "system": {"log_level": "info"},
        })
    }

    #[test]
    fn test_valid_config_accepted() {
        assert!(validate_remote_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_fps_out_of_range_rejected() {
        let mut config = valid_config();
        config["camera"]["fps"] = json!(999);
        let err = validate_remote_config(&config).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("fps"));
    }

    #[test]
    fn test_non_numeric_dimension_rejected() {
        let mut config = valid_config();
        config["camera"]["width"] = json!("wide");
        assert!(validate_remote_config(&config).is_err());
    }

    #[test]
    fn test_missing_required_section_rejected() {
        let config = json!({"camera": {"fps": 30}});
        let err = validate_remote_config(&config).unwrap_err();
        assert!(err.to_string().contains("system"));
    }

    #[test]
    fn test_boundary_values_accepted() {
        let mut config = valid_config();
        config["camera"]["fps"] = json!(1);
        config["camera"]["width"] = json!(1920);
        config["camera"]["height"] = json!(120);
        assert!(validate_remote_config(&config).is_ok());
    }

    #[test]
    fn test_merge_preserves_unrelated_keys() {
        let mut existing: toml::Value = r#"
            [camera]
            fps = 15
            rotation = 180

            [sync]
            batch_size = 50
        "#
        .parse()
        .unwrap();

        let incoming = toml::Value::try_from(json!({
            "camera": {"fps": 30},
            "system": {"log_level": "debug"},
        }))
        .unwrap();

        merge_sections(&mut existing, &incoming);

        assert_eq!(existing["camera"]["fps"].as_integer(), Some(30));
        // Keys the server did not send survive the merge
        assert_eq!(existing["camera"]["rotation"].as_integer(), Some(180));
        assert_eq!(existing["sync"]["batch_size"].as_integer(), Some(50));
        assert_eq!(existing["system"]["log_level"].as_str(), Some("debug"));
    }

    #[tokio::test]
    async fn test_newest_backup_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("config.toml.backup_20260101_000000");
        let b = dir.path().join("config.toml.backup_20260301_120000");
        std::fs::write(&a, "old").unwrap();
        std::fs::write(&b, "new").unwrap();

        let newest = newest_backup(dir.path()).await.unwrap().unwrap();
        assert_eq!(newest, b);
    }

    fn offline_client(
        dir: &tempfile::TempDir,
        config_path: &Path,
    ) -> (SharedConfig, ConfigSyncClient) {
        let mut config = EdgesyncConfig::default();
        config.device.device_id = "RPI_TEST0001".to_string();
        config.server.url = "http://127.0.0.1:9/api/v1".to_string();
        config.config_sync.backup_dir = dir.path().join("backup").to_string_lossy().to_string();
        config.storage.token_path = dir.path().join(".token").to_string_lossy().to_string();

        let api = Arc::new(crate::api::ServerApi::new(&config).unwrap());
        let auth = Arc::new(crate::auth::AuthManager::new(api.clone(), &config));
        let live = config.into_shared();
        let client = ConfigSyncClient::new(live.clone(), config_path.to_path_buf(), api, auth);
        (live, client)
    }

    #[tokio::test]
    async fn test_apply_swaps_live_configuration() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("edgesync.toml");
        std::fs::write(
            &config_path,
            "[device]\ndevice_id = \"RPI_TEST0001\"\n\n[sync]\nbatch_size = 50\n",
        )
        .unwrap();

        let (live, client) = offline_client(&dir, &config_path);
        assert_eq!(live.read().sync.batch_size, 50);

        let remote = RemoteConfig {
            config_version: 7,
            config: json!({
                "camera": {"fps": 30, "width": 1280, "height": 720},
                "system": {"log_level": "debug"},
                "sync": {"batch_size": 25},
            }),
        };
        client.apply_remote_config(&remote).await.unwrap();

        // Running workers read the new value through the shared handle
        assert_eq!(live.read().sync.batch_size, 25);

        // The file carries the merged document and the applied version
        let raw = std::fs::read_to_string(&config_path).unwrap();
        let doc: toml::Value = raw.parse().unwrap();
        assert_eq!(doc["sync"]["batch_size"].as_integer(), Some(25));
        assert_eq!(doc["system"]["config_version"].as_integer(), Some(7));
        assert_eq!(doc["device"]["device_id"].as_str(), Some("RPI_TEST0001"));

        // One backup of the previous file was taken
        let backups = std::fs::read_dir(dir.path().join("backup")).unwrap().count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_invalid_merged_config_leaves_state_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("edgesync.toml");
        std::fs::write(
            &config_path,
            "[device]\ndevice_id = \"RPI_TEST0001\"\n\n[sync]\nbatch_size = 50\n",
        )
        .unwrap();

        let (live, client) = offline_client(&dir, &config_path);

        // Passes the remote range checks but produces an unrunnable agent
        // configuration (zero batch size)
        let remote = RemoteConfig {
            config_version: 8,
            config: json!({
                "camera": {"fps": 30, "width": 1280, "height": 720},
                "system": {"log_level": "debug"},
                "sync": {"batch_size": 0},
            }),
        };
        let err = client.apply_remote_config(&remote).await.unwrap_err();
        assert!(!err.is_retryable());

        // Neither the live handle nor the file changed
        assert_eq!(live.read().sync.batch_size, 50);
        let raw = std::fs::read_to_string(&config_path).unwrap();
        let doc: toml::Value = raw.parse().unwrap();
        assert_eq!(doc["sync"]["batch_size"].as_integer(), Some(50));
    }

    #[tokio::test]
    async fn test_newest_backup_empty_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(newest_backup(dir.path()).await.unwrap().is_none());
        assert!(newest_backup(&dir.path().join("missing")).await.unwrap().is_none());
    }
}
