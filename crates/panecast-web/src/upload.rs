//! Content-addressed image uploads. A stored file is named by the hex
//! SHA-256 of its bytes, so re-uploading the same content is a no-op, and a
//! prompt naming the stored path is injected into the pane.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::AppState;

struct StoredUpload {
    path: PathBuf,
    hash: String,
    deduplicated: bool,
}

/// POST /s/{target}/upload - multipart form with an `image` field.
pub async fn upload_image(
    Path(target): Path<String>,
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?
    {
        if field.name() != Some("image") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let ext = normalize_ext(&filename).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unsupported file type: {filename:?}"),
            )
        })?;

        let data = field.bytes().await.map_err(|err| {
            (StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
        })?;

        let stored = store_upload(&state.upload_dir, ext, &data)
            .await
            .map_err(|err| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to save file: {err}"),
                )
            })?;

        if stored.deduplicated {
            info!(path = %stored.path.display(), hash = %stored.hash, "image upload deduplicated");
        } else {
            info!(
                path = %stored.path.display(),
                hash = %stored.hash,
                size = data.len(),
                "image uploaded"
            );
        }

        let session = state.registry.get(&target);
        session.bridge.write_input(
            format!("Analyze this image: {}\n", stored.path.display()).into_bytes(),
        );

        return Ok(Json(json!({ "path": stored.path, "hash": stored.hash })));
    }

    Err((StatusCode::BAD_REQUEST, "missing image field".to_string()))
}

fn normalize_ext(filename: &str) -> Option<&'static str> {
    let ext = FsPath::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some(".png"),
        "jpg" | "jpeg" => Some(".jpg"),
        "webp" => Some(".webp"),
        _ => None,
    }
}

async fn store_upload(
    dir: &FsPath,
    ext: &'static str,
    data: &[u8],
) -> std::io::Result<StoredUpload> {
    let hash = hex::encode(Sha256::digest(data));
    tokio::fs::create_dir_all(dir).await?;

    let dest = dir.join(format!("{hash}{ext}"));
    let abs = std::path::absolute(&dest).unwrap_or_else(|_| dest.clone());

    let deduplicated = tokio::fs::try_exists(&dest).await?;
    if !deduplicated {
        tokio::fs::write(&dest, data).await?;
    }

    Ok(StoredUpload {
        path: abs,
        hash,
        deduplicated,
    })
}
