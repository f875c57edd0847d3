use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use courier_gateway::connection;

use crate::state::AppState;

/// `GET /feed`: upgrade to the live WebSocket feed.
pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher))
}
