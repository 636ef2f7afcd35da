use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use box_installer_core::installer::{cursor, job::InstallJob};
use box_installer_core::progress::ProgressRecord;

use super::{ApiError, AppState};

pub const REQUEST_KEY_HEADER: &str = "X-Request-Key";
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

pub async fn install_box(
    State(state): State<AppState>,
    Path((cell, box_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    if !state.store.cell_exists(&cell) {
        return Err(ApiError::not_found(format!("cell {} not found", cell)));
    }
    if state.store.box_exists(&cell, &box_name) {
        return Err(ApiError::conflict(format!("box {} already exists", box_name)));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type != Some(ARCHIVE_CONTENT_TYPE) {
        return Err(bad_request(
            "INVALID_HEADER",
            format!("{} must be {}", header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE),
        ));
    }
    let permit = state
        .locks
        .try_acquire(&cell, &box_name)
        .ok_or_else(|| ApiError::conflict(format!("box {} is being installed", box_name)))?;

    let config = state.installer.config().clone();
    let limit = config.max_archive_size_bytes();
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.map_or(false, |len| len > limit) {
        return Err(too_large(limit));
    }

    let path = config.temp_dir.join(format!("{}.bar", Uuid::new_v4()));
    if let Err(err) = spool(body, &path, limit).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(err);
    }

    let scan_path = path.clone();
    let max_entry = config.max_entry_size_bytes();
    let scanned = tokio::task::spawn_blocking(move || cursor::prescan(&scan_path, max_entry)).await;
    let summary = match scanned {
        Ok(Ok(summary)) => summary,
        Ok(Err(err)) => {
            tracing::warn!(%cell, box_name = %box_name, "rejected archive: {}", err);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(bad_request(err.code, err.message()));
        }
        Err(join) => {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ApiError::internal(join.to_string()));
        }
    };
    if let Some(schema) = &summary.manifest.schema {
        if let Some(owner) = state.store.box_with_schema(&cell, schema) {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(bad_request(
                "SCHEMA_ALREADY_EXISTS",
                format!("schema {} is already used by box {}", schema, owner),
            ));
        }
    }

    let request_key = headers
        .get(REQUEST_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let job = InstallJob::new(cell.as_str(), box_name.as_str(), path)
        .with_request_key(request_key)
        .with_total_entries(summary.file_entries);

    let record = ProgressRecord::new(job.box_id, &cell, &box_name, job.total_entries);
    if let Err(e) = state.cache.put(&record.cache_key(), &record) {
        tracing::warn!(box_id = %job.box_id, "failed to store progress: {}", e);
    }
    state.installs.insert(&cell, &box_name, job.box_id);

    tracing::info!(
        %cell,
        box_name = %box_name,
        box_id = %job.box_id,
        entries = summary.file_entries,
        bytes = summary.total_bytes,
        "install accepted"
    );
    let installer = state.installer.clone();
    let installs = state.installs.clone();
    let key = (cell.clone(), box_name.clone());
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let outcome = installer.run(job);
        let box_id = outcome.record.box_id;
        match outcome.error {
            None => {
                // the box record now resolves its own identity
                installs.remove(&key.0, &key.1, box_id);
                tracing::info!(%box_id, "install completed");
            }
            Some(err) => tracing::warn!(%box_id, "install failed: {}", err),
        }
    });

    let location = format!(
        "{}/{}/{}",
        config.base_url.trim_end_matches('/'),
        cell,
        box_name
    );
    Ok((StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response())
}

fn bad_request(code: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, code, message)
}

fn too_large(limit: u64) -> ApiError {
    ApiError::new(
        StatusCode::PAYLOAD_TOO_LARGE,
        "PAYLOAD_TOO_LARGE",
        format!("archive exceeds {} bytes", limit),
    )
}

/// Stream the request body into `path`, failing once `limit` is passed.
async fn spool(body: Body, path: &std::path::Path, limit: u64) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let mut stream = body.into_data_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| bad_request("BAD_REQUEST", e.to_string()))?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(too_large(limit));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(written)
}
