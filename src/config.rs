use config::{Config, ConfigError, Environment, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared handle to the live configuration. The config sync client swaps
/// the value wholesale when a new remote version is applied; workers read
/// their settings through it at each use site.
pub type SharedConfig = Arc<RwLock<EdgesyncConfig>>;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EdgesyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub config_sync: ConfigSyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    /// Device identifier registered with the server
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// API key used for device authentication
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the application server API
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Timeout for server requests in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum number of events per sync batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Seconds between sync cycles
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,

    /// Maximum number of confirmed events kept locally
    #[serde(default = "default_max_stored_events")]
    pub max_stored_events: u32,

    /// Event types treated as high priority
    #[serde(default = "default_priority_types")]
    pub priority_types: Vec<String>,

    /// Attempts per request before giving up on the cycle
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Seconds between request retry attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionConfig {
    /// Seconds between connectivity checks
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,

    /// Well-known endpoint probed to distinguish "no internet" from "server down"
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Timeout for the connectivity probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeat reports
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConfigSyncConfig {
    /// Seconds between remote configuration checks
    #[serde(default = "default_config_check_interval")]
    pub check_interval_seconds: u64,

    /// Directory for timestamped configuration backups
    #[serde(default = "default_config_backup_dir")]
    pub backup_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Path to the local SQLite event database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Base path for event snapshot images
    #[serde(default = "default_image_path")]
    pub image_path: String,

    /// Maximum number of snapshot images kept on disk
    #[serde(default = "default_max_stored_images")]
    pub max_stored_images: u32,

    /// Path to the persisted device token file
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

impl EdgesyncConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("edgesync.toml")
    }

    /// Wrap this configuration in the shared live handle
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("device.device_id", default_device_id())?
            .set_default("device.api_key", default_api_key())?
            .set_default("server.url", default_server_url())?
            .set_default(
                "server.connection_timeout_seconds",
                default_connection_timeout(),
            )?
            .set_default("sync.batch_size", default_batch_size())?
            .set_default("sync.sync_interval_seconds", default_sync_interval())?
            .set_default("sync.max_stored_events", default_max_stored_events())?
            .set_default("sync.priority_types", default_priority_types())?
            .set_default("sync.retry_attempts", default_retry_attempts())?
            .set_default("sync.retry_delay_seconds", default_retry_delay())?
            .set_default(
                "connection.check_interval_seconds",
                default_check_interval(),
            )?
            .set_default("connection.probe_url", default_probe_url())?
            .set_default("connection.probe_timeout_seconds", default_probe_timeout())?
            .set_default("heartbeat.interval_seconds", default_heartbeat_interval())?
            .set_default(
                "config_sync.check_interval_seconds",
                default_config_check_interval(),
            )?
            .set_default("config_sync.backup_dir", default_config_backup_dir())?
            .set_default("storage.db_path", default_db_path())?
            .set_default("storage.image_path", default_image_path())?
            .set_default("storage.max_stored_images", default_max_stored_images())?
            .set_default("storage.token_path", default_token_path())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with EDGESYNC_ prefix
            .add_source(Environment::with_prefix("EDGESYNC").separator("_"))
            .build()?;

        let config: EdgesyncConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.device_id.is_empty() {
            return Err(ConfigError::Message(
                "Device id must not be empty".to_string(),
            ));
        }

        if self.server.url.is_empty() {
            return Err(ConfigError::Message(
                "Server URL must not be empty".to_string(),
            ));
        }

        if self.server.connection_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Connection timeout must be greater than 0".to_string(),
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(ConfigError::Message(
                "Sync batch size must be greater than 0".to_string(),
            ));
        }

        if self.sync.sync_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Sync interval must be greater than 0".to_string(),
            ));
        }

        if self.sync.max_stored_events == 0 {
            return Err(ConfigError::Message(
                "Max stored events must be greater than 0".to_string(),
            ));
        }

        if self.connection.check_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Connectivity check interval must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat.interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Heartbeat interval must be greater than 0".to_string(),
            ));
        }

        if self.config_sync.check_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Config check interval must be greater than 0".to_string(),
            ));
        }

        if self.storage.max_stored_images == 0 {
            return Err(ConfigError::Message(
                "Max stored images must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for EdgesyncConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            server: ServerConfig::default(),
            sync: SyncConfig::default(),
            connection: ConnectionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            config_sync: ConfigSyncConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            api_key: default_api_key(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            connection_timeout_seconds: default_connection_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sync_interval_seconds: default_sync_interval(),
            max_stored_events: default_max_stored_events(),
            priority_types: default_priority_types(),
            retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
            probe_url: default_probe_url(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
        }
    }
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_config_check_interval(),
            backup_dir: default_config_backup_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            image_path: default_image_path(),
            max_stored_images: default_max_stored_images(),
            token_path: default_token_path(),
        }
    }
}

// Default value functions
fn default_device_id() -> String {
    "DEV_UNKNOWN".to_string()
}
fn default_api_key() -> String {
    String::new()
}

fn default_server_url() -> String {
    "http://localhost/safety_system/api/v1".to_string()
}
fn default_connection_timeout() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    50
}
fn default_sync_interval() -> u64 {
    60
}
fn default_max_stored_events() -> u32 {
    1000
}
fn default_priority_types() -> Vec<String> {
    vec![
        "fatigue".to_string(),
        "unrecognized_operator".to_string(),
        "cellphone".to_string(),
    ]
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}

fn default_check_interval() -> u64 {
    30
}
fn default_probe_url() -> String {
    "https://www.google.com".to_string()
}
fn default_probe_timeout() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    120
}

fn default_config_check_interval() -> u64 {
    60
}
fn default_config_backup_dir() -> String {
    "./config_backup".to_string()
}

fn default_db_path() -> String {
    "./data/events.db".to_string()
}
fn default_image_path() -> String {
    "./data/images".to_string()
}
fn default_max_stored_images() -> u32 {
    500
}
fn default_token_path() -> String {
    "./data/.device_token".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let mut config = EdgesyncConfig::default();
        config.device.device_id = "RPI_TEST0001".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EdgesyncConfig::default();
        config.device.device_id = "RPI_TEST0001".to_string();

        // Zero batch size is invalid
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());

        config.sync.batch_size = 50;
        assert!(config.validate().is_ok());

        // Empty server URL is invalid
        config.server.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let mut config = EdgesyncConfig::default();
        config.device.device_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_priority_types_default() {
        let config = EdgesyncConfig::default();
        assert!(config
            .sync
            .priority_types
            .contains(&"fatigue".to_string()));
    }
}
