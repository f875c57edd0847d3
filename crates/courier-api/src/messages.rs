use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use courier_db::MessageCursor;
use courier_types::api::{MessageResponse, SendMessageRequest, SendMessageResponse};

use crate::error::ApiError;
use crate::outbound::OutboundRequest;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: the timestamp of the oldest message on the previous page,
    /// RFC 3339 in any offset.
    pub before: Option<String>,
    /// That message's id, to split rows sharing its timestamp.
    pub before_id: Option<String>,
}

impl MessageQuery {
    fn cursor(&self) -> Result<Option<MessageCursor>, ApiError> {
        let Some(before) = self.before.as_deref() else {
            return Ok(None);
        };
        let timestamp = DateTime::parse_from_rfc3339(before)
            .map_err(|_| {
                ApiError::InvalidMessage(format!("before '{before}' is not an RFC 3339 timestamp"))
            })?
            .with_timezone(&Utc);
        Ok(Some(MessageCursor {
            timestamp,
            id: self.before_id.clone(),
        }))
    }
}

fn default_limit() -> u32 {
    50
}

/// Largest `POST /messages` body: a base64-encoded attachment at the
/// biggest per-type limit, plus room for the JSON around it.
pub const SEND_BODY_LIMIT: usize = 34 * 1024 * 1024;

/// `POST /messages`
pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) =
        payload.map_err(|rejection| ApiError::from_json_rejection(rejection, SEND_BODY_LIMIT))?;
    let message = state
        .outbound
        .send(OutboundRequest {
            account_id: req.account_id,
            recipient_id: req.recipient_id,
            text: req.text,
            attachment: req.attachment,
            idempotency_key: req.idempotency_key,
        })
        .await?;

    Ok(Json(SendMessageResponse::from(&message)))
}

/// `GET /messages/{message_id}`
pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let id = message_id.clone();
    let message = tokio::task::spawn_blocking(move || db.get_message(&id))
        .await
        .map_err(ApiError::join)??
        .ok_or(ApiError::MessageNotFound(message_id))?;

    Ok(Json(MessageResponse::from(message)))
}

/// `GET /accounts/{account_id}/messages`: newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state.router.resolve_id(&account_id).await?;
    let cursor = query.cursor()?;

    let db = state.db.clone();
    let limit = query.limit.clamp(1, 200);
    let messages = tokio::task::spawn_blocking(move || {
        db.list_messages(account.id.as_str(), limit, cursor.as_ref())
    })
    .await
    .map_err(ApiError::join)??;

    let body: Vec<MessageResponse> = messages.into_iter().map(MessageResponse::from).collect();
    Ok(Json(body))
}
