pub mod accounts;
pub mod coordinator;
pub mod effects;
pub mod error;
pub mod extract;
pub mod feed;
pub mod health;
pub mod idempotency;
pub mod inbound;
pub mod media;
pub mod messages;
pub mod middleware;
pub mod outbound;
pub mod routing;
pub mod state;
pub mod webhook;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

pub use error::ApiError;
pub use state::{AppState, AppStateInner, RelayConfig};

/// All relay routes except static media, which the binary mounts itself.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route(
            "/webhook",
            get(webhook::verify_subscription).post(webhook::receive),
        )
        .route("/health", get(health::health))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/messages",
            post(messages::send_message).layer(DefaultBodyLimit::max(messages::SEND_BODY_LIMIT)),
        )
        .route("/messages/{message_id}", get(messages::get_message))
        .route("/accounts", post(accounts::register_account))
        .route("/accounts/{account_id}/messages", get(messages::list_messages))
        .route("/feed", get(feed::upgrade))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_api_token,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
