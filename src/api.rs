use crate::{
    config::EdgesyncConfig,
    error::{EdgesyncError, Result},
    store::StoredEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Standard response envelope used by every server endpoint
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Token grant returned by the authentication endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct AuthGrant {
    pub token: String,
    /// Token lifetime in seconds
    pub expires_in: i64,
}

/// Wire form of one event inside a batch upload
#[derive(Debug, Serialize)]
pub struct WireEvent {
    pub local_id: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    pub event_data: Value,
    pub event_time: String,
    pub has_image: bool,
    pub priority: i64,
}

impl WireEvent {
    pub fn from_stored(event: &StoredEvent) -> Self {
        Self {
            local_id: event.local_id.clone(),
            event_type: event.event_type.clone(),
            operator_id: event.operator_id.clone(),
            event_data: event.event_data.clone(),
            event_time: event.event_time.to_rfc3339(),
            has_image: event.image_path.is_some(),
            priority: event.priority,
        }
    }
}

/// Per-event acknowledgement included in a batch response
#[derive(Debug, Clone, Deserialize)]
pub struct EventAck {
    pub local_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchAck {
    #[serde(default)]
    pub events: Vec<EventAck>,
}

/// A remote configuration newer than the one the device is running
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub config_version: i64,
    pub config: Value,
}

/// A command the server attached to a heartbeat acknowledgement
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(flatten)]
    pub params: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatAck {
    #[serde(default)]
    pub config_pending: bool,
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
}

/// Typed client for the server REST surface.
///
/// This layer is stateless with respect to authentication: callers pass the
/// bearer token in, and a 401 surfaces as `EdgesyncError::Auth` so the token
/// owner can refresh and retry.
pub struct ServerApi {
    client: reqwest::Client,
    base_url: String,
    device_id: String,
    api_key: String,
}

impl ServerApi {
    pub fn new(config: &EdgesyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.server.connection_timeout_seconds))
            .user_agent(format!("edgesync/{}", config.device.device_id))
            .build()?;

        Ok(Self {
            client,
            base_url: config.server.url.trim_end_matches('/').to_string(),
            device_id: config.device.device_id.clone(),
            api_key: config.device.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange device credentials for a bearer token
    pub async fn authenticate(&self) -> Result<AuthGrant> {
        let payload = serde_json::json!({
            "device_id": self.device_id,
            "api_key": self.api_key,
        });

        let response = self
            .client
            .post(self.url("/auth/authenticate"))
            .json(&payload)
            .send()
            .await?;

        let data = self.expect_success(response).await?;
        let grant: AuthGrant = serde_json::from_value(data)
            .map_err(|e| EdgesyncError::protocol(format!("Malformed auth response: {}", e)))?;

        debug!(expires_in = grant.expires_in, "Authentication succeeded");
        Ok(grant)
    }

    /// Upload a batch of events. The server deduplicates on batch id, so
    /// re-sending the same batch after a crash is safe.
    pub async fn send_batch(
        &self,
        token: &str,
        batch_id: &str,
        events: &[WireEvent],
    ) -> Result<BatchAck> {
        let payload = serde_json::json!({
            "batch_id": batch_id,
            "device_id": self.device_id,
            "events": events,
        });

        let response = self
            .client
            .post(self.url("/sync/batch"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        // 206 means partial acceptance; per-event acks tell us which landed
        if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            warn!(batch_id = %batch_id, "Server accepted batch partially");
        }

        let data = self.expect_success(response).await?;
        let ack: BatchAck = serde_json::from_value(data).unwrap_or_default();
        Ok(ack)
    }

    /// Confirm that a previously sent batch can be finalized server-side
    pub async fn confirm_batch(&self, token: &str, batch_id: &str) -> Result<()> {
        let payload = serde_json::json!({
            "batch_id": batch_id,
            "device_id": self.device_id,
        });

        let response = self
            .client
            .post(self.url("/sync/confirm"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        self.expect_success(response).await?;
        Ok(())
    }

    /// Upload an event snapshot as multipart form data. `event_id` is the
    /// server-assigned id from the batch acknowledgement, not the local one.
    pub async fn upload_image(
        &self,
        token: &str,
        event_id: &str,
        file_name: &str,
        image: Vec<u8>,
    ) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(image)
            .file_name(file_name.to_string())
            .mime_str("image/jpeg")
            .map_err(|e| EdgesyncError::protocol(format!("Invalid image part: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("event_id", event_id.to_string())
            .part("image", part);

        let response = self
            .client
            .post(self.url("/events/upload_image"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;

        self.expect_success(response).await?;
        Ok(())
    }

    /// Ask the server for a configuration newer than `current_version`.
    /// Returns `None` when the device is already up to date.
    pub async fn fetch_config(
        &self,
        token: &str,
        current_version: i64,
    ) -> Result<Option<RemoteConfig>> {
        let response = self
            .client
            .get(self.url("/devices/config"))
            .bearer_auth(token)
            .query(&[
                ("device_id", self.device_id.as_str()),
                ("current_version", &current_version.to_string()),
            ])
            .send()
            .await?;

        let data = self.expect_success(response).await?;
        if data.get("config").map_or(true, Value::is_null) {
            return Ok(None);
        }

        let remote: RemoteConfig = serde_json::from_value(data)
            .map_err(|e| EdgesyncError::protocol(format!("Malformed config response: {}", e)))?;
        Ok(Some(remote))
    }

    /// Tell the server a configuration version was applied successfully
    pub async fn report_config_applied(&self, token: &str, version: i64) -> Result<()> {
        let payload = serde_json::json!({
            "action": "config_applied",
            "device_id": self.device_id,
            "config_version": version,
            "applied_at": chrono::Utc::now().to_rfc3339(),
        });
        self.post_config_report(token, payload).await
    }

    /// Report a configuration failure (validation or apply error)
    pub async fn report_config_error(
        &self,
        token: &str,
        error_message: &str,
        version: Option<i64>,
    ) -> Result<()> {
        let mut payload = serde_json::json!({
            "action": "config_error",
            "device_id": self.device_id,
            "error_message": error_message,
            "error_time": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(version) = version {
            payload["config_version"] = version.into();
        }
        self.post_config_report(token, payload).await
    }

    async fn post_config_report(&self, token: &str, payload: Value) -> Result<()> {
        let response = self
            .client
            .post(self.url("/devices/config"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        self.expect_success(response).await?;
        Ok(())
    }

    /// Send a heartbeat report; the acknowledgement may carry commands
    pub async fn send_heartbeat(&self, token: &str, report: &Value) -> Result<HeartbeatAck> {
        let response = self
            .client
            .post(self.url("/devices/heartbeat"))
            .bearer_auth(token)
            .json(report)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EdgesyncError::auth("Token rejected during heartbeat"));
        }
        if !status.is_success() {
            return Err(EdgesyncError::protocol(format!(
                "Heartbeat rejected with HTTP {}",
                status
            )));
        }

        let ack: HeartbeatAck = response.json().await.unwrap_or_default();
        Ok(ack)
    }

    /// Cheap reachability check against the server health endpoint. Any HTTP
    /// response counts as reachable only if it is a success status.
    pub async fn check_server_reachable(&self) -> bool {
        match self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Server health check failed: {}", e);
                false
            }
        }
    }

    // Shared response handling: map HTTP and envelope-level failures into
    // the error taxonomy and hand back the `data` payload.
    async fn expect_success(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EdgesyncError::auth("Server rejected token (HTTP 401)"));
        }
        if status.is_server_error() {
            return Err(EdgesyncError::network(format!(
                "Server error: HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EdgesyncError::protocol(format!(
                "Unexpected HTTP {}: {}",
                status, body
            )));
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| EdgesyncError::protocol(format!("Unparseable response body: {}", e)))?;

        if envelope.status != "success" {
            return Err(EdgesyncError::protocol(format!(
                "Server reported failure: {}",
                envelope.message.unwrap_or_else(|| envelope.status.clone())
            )));
        }

        Ok(envelope.data.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PRIORITY_HIGH;
    use chrono::Utc;

    #[test]
    fn test_wire_event_from_stored() {
        let stored = StoredEvent {
            local_id: "abc".to_string(),
            event_type: "fatigue".to_string(),
            operator_id: Some("op-7".to_string()),
            event_data: serde_json::json!({"level": 0.8}),
            image_path: Some("/data/images/fatigue/x.jpg".to_string()),
            event_time: Utc::now(),
            created_at: Utc::now(),
            is_synced: false,
            sync_batch_id: None,
            priority: PRIORITY_HIGH,
        };

        let wire = WireEvent::from_stored(&stored);
        assert_eq!(wire.local_id, "abc");
        assert!(wire.has_image);
        assert_eq!(wire.priority, PRIORITY_HIGH);

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["event_type"], "fatigue");
        assert_eq!(json["has_image"], true);
    }

    #[test]
    fn test_wire_event_omits_missing_operator() {
        let stored = StoredEvent {
            local_id: "abc".to_string(),
            event_type: "distraction".to_string(),
            operator_id: None,
            event_data: serde_json::Value::Null,
            image_path: None,
            event_time: Utc::now(),
            created_at: Utc::now(),
            is_synced: false,
            sync_batch_id: None,
            priority: 2,
        };

        let json = serde_json::to_value(WireEvent::from_stored(&stored)).unwrap();
        assert!(json.get("operator_id").is_none());
        assert_eq!(json["has_image"], false);
    }

    #[test]
    fn test_heartbeat_ack_defaults() {
        let ack: HeartbeatAck = serde_json::from_str("{}").unwrap();
        assert!(!ack.config_pending);
        assert!(ack.commands.is_empty());

        let ack: HeartbeatAck = serde_json::from_str(
            r#"{"config_pending": true, "commands": [{"type": "restart_detection"}]}"#,
        )
        .unwrap();
        assert!(ack.config_pending);
        assert_eq!(ack.commands[0].command_type, "restart_detection");
    }

    #[test]
    fn test_device_command_keeps_params() {
        let cmd: DeviceCommand =
            serde_json::from_str(r#"{"type": "update_log_level", "level": "debug"}"#).unwrap();
        assert_eq!(cmd.command_type, "update_log_level");
        assert_eq!(cmd.params["level"], "debug");
    }
}
