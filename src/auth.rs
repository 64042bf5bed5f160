use crate::{
    api::ServerApi,
    config::EdgesyncConfig,
    error::{EdgesyncError, Result},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Safety margin subtracted from the token lifetime. A token inside the
/// margin is treated as already expired so requests never race expiry.
fn expiry_margin() -> Duration {
    Duration::minutes(5)
}

/// Minimum spacing between authentication attempts
fn auth_throttle() -> Duration {
    Duration::minutes(1)
}

/// Persisted form of a granted token
#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    expires_at: DateTime<Utc>,
    device_id: String,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AuthState {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
}

impl AuthState {
    fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.token, self.expires_at) {
            (Some(token), Some(expires_at)) if token_is_fresh(expires_at, now) => {
                Some(token.as_str())
            }
            _ => None,
        }
    }
}

fn token_is_fresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now < expires_at - expiry_margin()
}

/// Owns the device token lifecycle: acquisition, expiry tracking, throttled
/// renewal, and persistence across restarts.
///
/// The state lock is held across the authentication request, which serializes
/// concurrent callers so only one of them hits the auth endpoint.
pub struct AuthManager {
    api: Arc<ServerApi>,
    device_id: String,
    token_path: PathBuf,
    state: Mutex<AuthState>,
}

impl AuthManager {
    pub fn new(api: Arc<ServerApi>, config: &EdgesyncConfig) -> Self {
        let token_path = PathBuf::from(&config.storage.token_path);
        let mut state = AuthState::default();

        if let Some((token, expires_at)) =
            load_token_file(&token_path, &config.device.device_id, Utc::now())
        {
            info!("Stored device token loaded and still valid");
            state.token = Some(token);
            state.expires_at = Some(expires_at);
        }

        Self {
            api,
            device_id: config.device.device_id.clone(),
            token_path,
            state: Mutex::new(state),
        }
    }

    /// Return a token that is guaranteed fresh, authenticating if needed.
    /// Fails when the server is unreachable or an attempt happened less than
    /// a minute ago.
    pub async fn get_valid_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(token) = state.valid_token(now) {
            return Ok(token.to_string());
        }

        if let Some(last) = state.last_attempt {
            if now - last < auth_throttle() {
                return Err(EdgesyncError::auth(
                    "Authentication throttled; last attempt under a minute ago",
                ));
            }
        }
        state.last_attempt = Some(now);

        debug!("No fresh token; authenticating with server");
        let grant = self.api.authenticate().await?;
        let expires_at = now + Duration::seconds(grant.expires_in);

        state.token = Some(grant.token.clone());
        state.expires_at = Some(expires_at);

        if let Err(e) = save_token_file(&self.token_path, &StoredToken {
            token: grant.token.clone(),
            expires_at,
            device_id: self.device_id.clone(),
            saved_at: now,
        }) {
            warn!("Could not persist device token: {}", e);
        }

        info!(expires_at = %expires_at, "Device authenticated");
        Ok(grant.token)
    }

    /// Drop the current token so the next caller re-authenticates. Used when
    /// the server answers 401 despite a locally fresh token.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.token = None;
        state.expires_at = None;
    }

    /// Whether a fresh token is currently held (no network traffic)
    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.valid_token(Utc::now()).is_some()
    }

    /// Force renewal regardless of the current token's freshness
    pub async fn refresh(&self) -> Result<String> {
        self.invalidate().await;
        self.get_valid_token().await
    }
}

/// Read a persisted token, discarding it when it belongs to another device,
/// is inside the expiry margin, or cannot be parsed. Corrupt files are
/// removed.
fn load_token_file(
    path: &Path,
    device_id: &str,
    now: DateTime<Utc>,
) -> Option<(String, DateTime<Utc>)> {
    if !path.exists() {
        return None;
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Could not read token file: {}", e);
            return None;
        }
    };

    let stored: StoredToken = match serde_json::from_str(&raw) {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Corrupt token file, removing: {}", e);
            let _ = std::fs::remove_file(path);
            return None;
        }
    };

    if stored.device_id != device_id {
        info!("Stored token belongs to another device, ignoring");
        return None;
    }

    if !token_is_fresh(stored.expires_at, now) {
        info!("Stored token has expired");
        return None;
    }

    Some((stored.token, stored.expires_at))
}

/// Persist the token with owner-only permissions
fn save_token_file(path: &Path, stored: &StoredToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let raw = serde_json::to_string_pretty(stored)
        .map_err(|e| EdgesyncError::protocol(format!("Token serialization failed: {}", e)))?;
    std::fs::write(path, raw)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
