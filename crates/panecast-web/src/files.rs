//! Filesystem browse handlers: list a directory, fetch a file, save over an
//! existing file. Paths are taken as given; this server fronts a single
//! user's own machine.

use axum::body::Bytes;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

pub const MAX_SAVE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    name: String,
    is_dir: bool,
    size: u64,
}

/// GET /api/files?path= - directory listing, hidden entries skipped,
/// directories first.
pub async fn list_dir(
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .or_else(|| std::env::var("HOME").ok())
        .unwrap_or_else(|| "/".to_string());
    let abs = std::path::absolute(&path)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid path".to_string()))?;

    let meta = tokio::fs::metadata(&abs)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "not found".to_string()))?;
    if !meta.is_dir() {
        return Err((StatusCode::BAD_REQUEST, "not a directory".to_string()));
    }

    let mut entries = tokio::fs::read_dir(&abs)
        .await
        .map_err(|_| (StatusCode::FORBIDDEN, "cannot read directory".to_string()))?;

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        files.push(FileEntry {
            name,
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }

    files.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(Json(json!({ "path": abs, "files": files })))
}

/// GET /api/file?path= - raw file contents.
pub async fn file_content(
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing path".to_string()))?;
    let abs = std::path::absolute(&path)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid path".to_string()))?;

    let meta = tokio::fs::metadata(&abs)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "not found".to_string()))?;
    if meta.is_dir() {
        return Err((StatusCode::BAD_REQUEST, "is a directory".to_string()));
    }

    let body = tokio::fs::read(&abs)
        .await
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "read error".to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    ))
}

/// POST /api/file?path= - overwrite an existing file. Creating new files is
/// refused.
pub async fn save_file(
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, String)> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing path".to_string()))?;
    let abs = std::path::absolute(&path)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid path".to_string()))?;

    if tokio::fs::metadata(&abs).await.is_err() {
        return Err((StatusCode::NOT_FOUND, "file not found".to_string()));
    }
    if body.len() > MAX_SAVE_BYTES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            "file too large".to_string(),
        ));
    }

    tokio::fs::write(&abs, &body)
        .await
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "save failed".to_string()))?;

    info!(path = %abs.display(), bytes = body.len(), "file saved");
    Ok(Json(json!({ "ok": true, "path": abs })))
}
