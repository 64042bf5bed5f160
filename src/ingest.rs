use crate::{
    error::{EdgesyncError, Result},
    images::ImageStore,
    store::LocalEventStore,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Number,
    String,
}

/// Required payload fields per event type. Events are validated at
/// registration so malformed payloads are rejected at the source instead of
/// surfacing as server-side sync failures.
const EVENT_SCHEMAS: &[(&str, &[(&str, FieldKind)])] = &[
    ("fatigue", &[("level", FieldKind::Number)]),
    ("distraction", &[("duration_seconds", FieldKind::Number)]),
    ("cellphone", &[("confidence", FieldKind::Number)]),
    ("smoking", &[("confidence", FieldKind::Number)]),
    ("unrecognized_operator", &[("reason", FieldKind::String)]),
];

fn validate_payload(event_type: &str, payload: &Value) -> Result<()> {
    let Some((_, required)) = EVENT_SCHEMAS.iter().find(|(t, _)| *t == event_type) else {
        return Err(EdgesyncError::validation(format!(
            "Unknown event type: {}",
            event_type
        )));
    };

    let Some(object) = payload.as_object() else {
        return Err(EdgesyncError::validation(format!(
            "Payload for '{}' must be an object",
            event_type
        )));
    };

    for (field, kind) in *required {
        let Some(value) = object.get(*field) else {
            return Err(EdgesyncError::validation(format!(
                "Payload for '{}' is missing required field '{}'",
                event_type, field
            )));
        };
        let ok = match kind {
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
        };
        if !ok {
            return Err(EdgesyncError::validation(format!(
                "Field '{}' of '{}' has the wrong type: {}",
                field, event_type, value
            )));
        }
    }

    Ok(())
}

/// Combined storage statistics for diagnostics
#[derive(Debug, Serialize)]
pub struct StorageStats {
    pub pending_events: u64,
    pub synced_events: u64,
    pub stored_images: u64,
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub events_deleted: u64,
    pub images_deleted: u64,
}

/// Entry point for detection modules: validates the payload, stores an
/// optional snapshot, and records the event for synchronization.
pub struct EventIngest {
    store: Arc<LocalEventStore>,
    images: Arc<ImageStore>,
}

impl EventIngest {
    pub fn new(store: Arc<LocalEventStore>, images: Arc<ImageStore>) -> Self {
        Self { store, images }
    }

    /// Register a detected event. The snapshot is best-effort: a failed
    /// image write degrades the event to image-less instead of dropping it.
    pub async fn register_event(
        &self,
        event_type: &str,
        event_data: Value,
        snapshot: Option<&[u8]>,
        operator_id: Option<&str>,
    ) -> Result<String> {
        validate_payload(event_type, &event_data)?;

        let image_path = match snapshot {
            Some(data) => match self.images.save_image(event_type, data).await {
                Ok(path) => Some(path.to_string_lossy().to_string()),
                Err(e) => {
                    warn!(event_type = %event_type, "Snapshot not stored: {}", e);
                    None
                }
            },
            None => None,
        };

        let local_id = self
            .store
            .store_event(event_type, &event_data, image_path.as_deref(), operator_id)
            .await?;

        info!(event_type = %event_type, local_id = %local_id, "Event registered");
        Ok(local_id)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            pending_events: self.store.count_pending_events().await?,
            synced_events: self.store.count_synced_events().await?,
            stored_images: self.images.count_images().await?,
        })
    }

    /// Run both retention sweeps
    pub async fn cleanup_storage(&self) -> Result<CleanupReport> {
        Ok(CleanupReport {
            events_deleted: self.store.cleanup_old_events().await?,
            images_deleted: self.images.cleanup_old_images().await?,
        })
    }
}
