use axum::{
    extract::{Path, State},
    Json,
};
use box_installer_core::progress::{cache_key, InstallStatus, ProgressMessage, ProgressRecord};
use box_installer_core::storage::Scope;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, AppState};

/// Body of `GET /{cell}/{box}/status`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ProgressMessage>,
}

fn timestamp(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl From<&ProgressRecord> for StatusResponse {
    fn from(record: &ProgressRecord) -> Self {
        let mut response = StatusResponse {
            status: record.status.as_str().to_string(),
            schema: record.schema.clone(),
            started_at: None,
            progress: None,
            installed_at: None,
            message: None,
        };
        match record.status {
            InstallStatus::Pending => {}
            InstallStatus::Running => {
                response.started_at = timestamp(record.started_at);
                response.progress = Some(format!("{}%", record.percent()));
            }
            InstallStatus::Completed => {
                response.installed_at = timestamp(record.ended_at);
            }
            InstallStatus::Failed => {
                response.started_at = timestamp(record.started_at);
                response.progress = Some(format!("{}%", record.percent()));
                response.message = record.message.clone();
            }
        }
        response
    }
}

pub async fn box_status(
    State(state): State<AppState>,
    Path((cell, box_name)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let box_id = state
        .installs
        .get(&cell, &box_name)
        .or_else(|| state.store.box_id(&cell, &box_name));

    if let Some(box_id) = box_id {
        let record = state
            .cache
            .get(&cache_key(box_id))
            .map_err(|e| ApiError::internal(e.to_string()))?;
        if let Some(record) = record {
            return Ok(Json(StatusResponse::from(&record)));
        }
    }

    if state.store.box_exists(&cell, &box_name) {
        let schema = state
            .store
            .record(&Scope::Cell(cell.clone()), "Box", &format!("(Name='{}')", box_name))
            .and_then(|fields| fields.get("Schema").and_then(Value::as_str).map(str::to_string));
        return Ok(Json(StatusResponse {
            status: "ready".to_string(),
            schema,
            started_at: None,
            progress: None,
            installed_at: None,
            message: None,
        }));
    }
    Err(ApiError::not_found(format!("box {} not found", box_name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn test_status_fields_follow_state() {
        let mut record = ProgressRecord::new(Uuid::new_v4(), "cell1", "box1", 4);
        assert_eq!(StatusResponse::from(&record).status, "PENDING");

        record.status = InstallStatus::Running;
        record.processed = 1;
        record.started_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let running = StatusResponse::from(&record);
        assert_eq!(running.progress.as_deref(), Some("25%"));
        assert_eq!(running.started_at.as_deref(), Some("2024-05-01T12:00:00.000Z"));
        assert!(running.installed_at.is_none());

        record.status = InstallStatus::Completed;
        record.ended_at = record.started_at;
        let completed = StatusResponse::from(&record);
        assert_eq!(completed.installed_at.as_deref(), Some("2024-05-01T12:00:00.000Z"));
        assert!(completed.progress.is_none());
    }
}
