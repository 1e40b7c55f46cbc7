mod auth;
mod ping;
mod rooms;

use std::sync::Arc;

use arena_core::broadcast::{lobby_state_envelope, state_envelope};
use arena_core::error::CoreError;
use arena_core::registry::ConnectionRegistry;
use arena_core::AppState;
use arena_models::gateway::*;
use serde::Serialize;
use serde_json::{json, Value};

use crate::connection::Connection;
use crate::dispatcher::{EventContext, EventRouter};

/// Every message type the gateway understands.
pub fn build_router() -> EventRouter {
    EventRouter::new()
        .route(EVENT_AUTH, auth::handle_auth)
        .route(EVENT_PING, ping::handle_ping)
        .route(EVENT_ROOM_CREATE, rooms::handle_create)
        .route(EVENT_ROOM_JOIN, rooms::handle_join)
        .route(EVENT_ROOM_LEAVE, rooms::handle_leave)
        .route(EVENT_ROOM_CHAT, rooms::handle_chat)
        .route(EVENT_ROOM_STATE, rooms::handle_state)
        .route(EVENT_ROOM_START, rooms::handle_start)
}

pub(crate) async fn reply<T: Serialize>(connection: &Connection, payload: T) -> Result<(), CoreError> {
    connection
        .send_json(&payload)
        .await
        .map_err(|e| CoreError::Delivery(e.to_string()))
}

pub(crate) fn error_envelope(event_type: &str, error: impl std::fmt::Display) -> Value {
    json!({ "type": event_type, "error": error.to_string() })
}

/// User bound to this connection, if it has authenticated.
pub(crate) async fn authenticated_user(ctx: &EventContext<'_>) -> Result<Option<String>, CoreError> {
    let entry = ctx.registry.get(ctx.connection_id).await?;
    Ok(entry
        .filter(|entry| entry.is_authenticated())
        .map(|entry| entry.user_id))
}

/// Sends the user's current room state and starts forwarding that room, or
/// sends the lobby state when the user is in no room.
pub(crate) async fn deliver_room_state(
    state: &AppState,
    connection: &Arc<Connection>,
    user_id: &str,
) -> Result<(), CoreError> {
    if let Some(code) = state.rooms.user_room(user_id).await? {
        match state.rooms.query(&code).await {
            Ok(snapshot) => {
                reply(connection, state_envelope(&snapshot)).await?;
                start_forwarding(state, connection, &code).await;
                return Ok(());
            }
            Err(CoreError::NotFound) => {
                tracing::debug!(user_id, code = %code, "room pointer names a deleted room");
            }
            Err(e) => return Err(e),
        }
    }
    reply(connection, lobby_state_envelope()).await
}

/// Relays the room's channel to this connection until the connection closes or
/// the subscription is ended. A second call for the same room is a no-op.
pub async fn start_forwarding(state: &AppState, connection: &Arc<Connection>, code: &str) {
    let Some(subscription) = connection.track_subscription(code) else {
        return;
    };
    let feed = match state.rooms.broadcaster().open(code).await {
        Ok(feed) => feed,
        Err(error) => {
            tracing::warn!(connection_id = connection.id(), code, %error, "room subscription failed");
            connection.release_subscription(code, subscription.id);
            return;
        }
    };
    tracing::debug!(connection_id = connection.id(), code, "forwarding room events");

    let connection = connection.clone();
    let code = code.to_string();
    tokio::spawn(async move {
        let result = feed
            .forward(subscription.token.clone(), |payload| {
                let connection = connection.clone();
                async move { connection.send_text(payload).await }
            })
            .await;
        match result {
            Err(CoreError::Delivery(error)) => {
                tracing::info!(connection_id = connection.id(), code = %code, %error, "write failed, closing connection");
                connection.shutdown();
            }
            Err(error) => {
                tracing::debug!(connection_id = connection.id(), code = %code, %error, "room forwarding ended");
            }
            Ok(()) => {}
        }
        connection.release_subscription(&code, subscription.id);
    });
}
