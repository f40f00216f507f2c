use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use libpanecast::tmux;

use crate::AppState;

/// GET /api/panes - every pane tmux knows about, grouped by session and
/// window, for the frontend's switcher.
pub async fn list_panes() -> Result<Json<Value>, (StatusCode, String)> {
    let sessions = tmux::list_panes()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
}

/// GET /api/search?q=&limit= - filename index lookup.
pub async fn search_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Json<Value> {
    let results = state.indexer.search(&query.q, query.limit.unwrap_or(50));
    Json(json!({
        "results": results,
        "indexed": state.indexer.count(),
    }))
}
