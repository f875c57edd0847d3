use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || db.ping())
        .await
        .map_err(ApiError::join)??;

    let listeners = state.dispatcher.listener_count().await;
    Ok(Json(json!({ "status": "ok", "listeners": listeners })))
}
