use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use courier_crypto::signature::constant_time_eq;

use crate::error::ApiError;
use crate::state::AppState;

/// Require `Authorization: Bearer <api token>`.
pub async fn require_api_token(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(auth) = auth.ok_or(ApiError::Unauthorized)?;

    if state.config.api_token.is_empty()
        || !constant_time_eq(auth.token().as_bytes(), state.config.api_token.as_bytes())
    {
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}
