pub mod connection;
pub mod dispatcher;
pub mod events;
mod handler;

use std::sync::Arc;

use arena_core::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::dispatcher::EventRouter;

pub fn gateway_router() -> Router<AppState> {
    let events = Arc::new(events::build_router());
    Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade, state: State<AppState>| {
            ws_upgrade(ws, state, events.clone())
        }),
    )
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    events: Arc<EventRouter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, events))
}
