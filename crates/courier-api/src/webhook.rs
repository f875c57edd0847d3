use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use tracing::{debug, info, warn};

use courier_crypto::signature::{SIGNATURE_HEADER, constant_time_eq, verify};
use courier_types::api::WebhookVerifyQuery;

use crate::error::ApiError;
use crate::extract::WebhookPayload;
use crate::inbound::InboundOutcome;
use crate::state::AppState;

/// `GET /webhook`: subscription handshake. Echoes `hub.challenge` back when
/// the mode is `subscribe` and the token matches.
pub async fn verify_subscription(
    State(state): State<AppState>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, ApiError> {
    let token_ok = query.verify_token.as_deref().is_some_and(|token| {
        constant_time_eq(token.as_bytes(), state.config.verify_token.as_bytes())
    });

    match (query.mode.as_deref(), query.challenge) {
        (Some("subscribe"), Some(challenge)) if token_ok => {
            info!("Webhook subscription verified");
            Ok(challenge)
        }
        _ => {
            warn!(mode = ?query.mode, "webhook verification rejected");
            Err(ApiError::VerificationFailed)
        }
    }
}

/// `POST /webhook`: inbound delivery.
///
/// The signature is checked over the raw body before anything is parsed.
/// After that the delivery is always acknowledged, whatever happened to its
/// individual events.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !verify(&body, signature, &state.config.app_secret) {
        warn!(bytes = body.len(), "webhook signature rejected");
        return Err(ApiError::SignatureInvalid);
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Unparseable webhook body acknowledged: {}", e);
            return Ok(StatusCode::OK);
        }
    };

    let outcomes = state.inbound.process(&payload).await;

    let stored = outcomes
        .iter()
        .filter(|o| matches!(o, InboundOutcome::Stored { .. }))
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, InboundOutcome::Failed { .. } | InboundOutcome::Unrouted { .. }))
        .count();
    debug!(
        object = payload.object.as_deref().unwrap_or_default(),
        events = outcomes.len(),
        stored,
        failed,
        "webhook delivery processed"
    );

    Ok(StatusCode::OK)
}
