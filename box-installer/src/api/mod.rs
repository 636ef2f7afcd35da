//! HTTP API for submitting bulk archives and polling install progress.

mod install;
mod status;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use box_installer_core::events::EventBus;
use box_installer_core::installer::Installer;
use box_installer_core::progress::ProgressCache;
use box_installer_core::storage::MemoryStore;

use crate::lock::InstallLocks;

pub use status::StatusResponse;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub installer: Arc<Installer>,
    pub cache: Arc<dyn ProgressCache>,
    pub events: EventBus,
    pub locks: InstallLocks,
    pub installs: InstallRegistry,
}

impl AppState {
    pub fn new(store: Arc<MemoryStore>, installer: Installer, cache: Arc<dyn ProgressCache>, events: EventBus) -> Self {
        let ttl = Duration::from_secs(installer.config().progress_ttl_secs);
        Self {
            store,
            installer: Arc::new(installer.with_events(events.clone())),
            cache,
            events,
            locks: InstallLocks::new(),
            installs: InstallRegistry::new(ttl),
        }
    }
}

/// Identity assigned to each accepted install, by (cell, box). An entry is
/// dropped once its box exists, or when it outlives the progress record it
/// points at.
#[derive(Clone)]
pub struct InstallRegistry {
    entries: Arc<RwLock<HashMap<(String, String), (Uuid, Instant)>>>,
    ttl: Duration,
}

impl InstallRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn insert(&self, cell: &str, box_name: &str, box_id: Uuid) {
        let mut entries = self.entries.write();
        entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
        entries.insert((cell.to_string(), box_name.to_string()), (box_id, Instant::now()));
    }

    pub fn get(&self, cell: &str, box_name: &str) -> Option<Uuid> {
        self.entries
            .read()
            .get(&(cell.to_string(), box_name.to_string()))
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(box_id, _)| *box_id)
    }

    /// Forget the entry if it still belongs to `box_id`.
    pub fn remove(&self, cell: &str, box_name: &str, box_id: Uuid) {
        let key = (cell.to_string(), box_name.to_string());
        let mut entries = self.entries.write();
        if entries.get(&key).map(|(id, _)| *id) == Some(box_id) {
            entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/{cell}/{box_name}", post(install::install_box))
        .route("/{cell}/{box_name}/status", get(status::box_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_forgets_finished_and_expired_installs() {
        let registry = InstallRegistry::new(Duration::from_secs(60));
        let first = Uuid::new_v4();
        registry.insert("cell1", "box1", first);
        assert_eq!(registry.get("cell1", "box1"), Some(first));

        registry.remove("cell1", "box1", Uuid::new_v4());
        assert_eq!(registry.get("cell1", "box1"), Some(first));
        registry.remove("cell1", "box1", first);
        assert!(registry.is_empty());

        let expired = InstallRegistry::new(Duration::ZERO);
        expired.insert("cell1", "box1", first);
        assert!(expired.get("cell1", "box1").is_none());
        expired.insert("cell1", "box2", first);
        assert_eq!(expired.len(), 1);
    }
}
