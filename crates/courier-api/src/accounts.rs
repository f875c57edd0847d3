use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use tracing::{error, info};

use courier_db::DbError;
use courier_types::api::{AccountResponse, RegisterAccountRequest};
use courier_types::models::{Account, AccountId};

use crate::error::ApiError;
use crate::state::AppState;

/// `POST /accounts`: link an account. The send credential is sealed before
/// it is stored and never returned.
pub async fn register_account(
    State(state): State<AppState>,
    Json(req): Json<RegisterAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    for (field, value) in [
        ("id", &req.id),
        ("platform_account_id", &req.platform_account_id),
        ("channel_id", &req.channel_id),
        ("send_credential", &req.send_credential),
        ("webhook_secret", &req.webhook_secret),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::InvalidMessage(format!("{field} is required")));
        }
    }

    let credential = state.vault.seal(&req.send_credential).map_err(|e| {
        error!("failed to seal send credential: {}", e);
        ApiError::Internal("failed to seal credential".into())
    })?;

    let account = Account {
        id: AccountId::new(req.id),
        platform_account_id: req.platform_account_id,
        channel_id: req.channel_id,
        webhook_secret: req.webhook_secret,
        crm_webhook_url: req.crm_webhook_url.filter(|url| !url.is_empty()),
        credential,
        created_at: Utc::now(),
    };

    let db = state.db.clone();
    let stored = account.clone();
    tokio::task::spawn_blocking(move || db.insert_account(&stored))
        .await
        .map_err(ApiError::join)?
        .map_err(|e| match e {
            DbError::DuplicateAccount(id) => ApiError::DuplicateAccount(id),
            other => ApiError::Storage(other),
        })?;

    info!(account_id = %account.id, channel_id = %account.channel_id, "account linked");

    Ok((
        StatusCode::CREATED,
        Json(AccountResponse {
            id: account.id,
            platform_account_id: account.platform_account_id,
            channel_id: account.channel_id,
            crm_webhook_url: account.crm_webhook_url,
            created_at: account.created_at,
        }),
    ))
}
