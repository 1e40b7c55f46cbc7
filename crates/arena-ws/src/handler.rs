use std::sync::Arc;

use arena_core::error::CoreError;
use arena_core::registry::ConnectionRegistry;
use arena_core::AppState;
use arena_models::connection::ConnectionState;
use arena_models::gateway::EVENT_ERROR;
use axum::extract::ws::{close_code, Message, WebSocket};
use futures_util::StreamExt;
use tokio::time::{Duration, Instant};

use crate::connection::Connection;
use crate::dispatcher::{DispatchError, EventRouter};
use crate::events::{error_envelope, reply};

pub async fn handle_connection(socket: WebSocket, state: AppState, router: Arc<EventRouter>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (sender, mut receiver) = socket.split();
    let connection = Arc::new(Connection::new(connection_id.clone(), sender));

    if let Err(error) = state
        .registry
        .set(&connection_id, "", ConnectionState::Connecting)
        .await
    {
        tracing::warn!(connection_id = %connection_id, %error, "failed to register connection");
    }
    tracing::info!(connection_id = %connection_id, "gateway connection opened");

    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs.max(1));
    let idle_sleep = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle_sleep);

    let (reason, timed_out) = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text(&state, &router, &connection, text.as_str()).await {
                            break ("write failed".to_string(), false);
                        }
                        idle_sleep.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let unsupported = error_envelope(EVENT_ERROR, "binary frames are not supported");
                        if reply(&connection, unsupported).await.is_err() {
                            break ("write failed".to_string(), false);
                        }
                        idle_sleep.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        break (
                            match frame {
                                Some(frame) => format!(
                                    "client close frame (code={}, reason={})",
                                    frame.code, frame.reason
                                ),
                                None => "client close frame (no code/reason)".to_string(),
                            },
                            false,
                        );
                    }
                    Some(Err(err)) => {
                        break (format!("websocket receive error: {err}"), false);
                    }
                    None => {
                        break ("websocket stream ended".to_string(), false);
                    }
                }
            }
            () = &mut idle_sleep => {
                break (format!("idle for {}s", idle_timeout.as_secs()), true);
            }
            () = connection.closed() => {
                break ("room delivery failed".to_string(), false);
            }
        }
    };

    connection.shutdown();
    if timed_out {
        connection.close(close_code::NORMAL, "idle timeout").await;
        tracing::warn!(connection_id = %connection_id, reason = %reason, "gateway connection closed");
    } else {
        tracing::info!(connection_id = %connection_id, reason = %reason, "gateway connection closed");
    }

    if let Err(error) = state
        .registry
        .update_state(&connection_id, ConnectionState::Closed)
        .await
    {
        tracing::debug!(connection_id = %connection_id, %error, "failed to mark connection closed");
    }
    if let Err(error) = state.registry.delete(&connection_id).await {
        tracing::warn!(connection_id = %connection_id, %error, "failed to remove connection");
    }
}

/// Dispatches one text frame. Returns `false` once the socket can no longer be
/// written to.
async fn handle_text(
    state: &AppState,
    router: &EventRouter,
    connection: &Arc<Connection>,
    raw: &str,
) -> bool {
    let connection_id = connection.id();
    let mut writable = true;
    let event_type = match router.dispatch(state, connection, connection_id, raw).await {
        Ok(dispatched) => {
            if !dispatched.handled {
                tracing::debug!(connection_id, event_type = %dispatched.event_type, "unhandled message type");
            }
            Some(dispatched.event_type)
        }
        Err(DispatchError::Handler {
            event_type,
            source: CoreError::Delivery(error),
        }) => {
            tracing::debug!(connection_id, %error, event_type = %event_type, "reply could not be written");
            writable = false;
            Some(event_type)
        }
        Err(error) => {
            tracing::debug!(connection_id, %error, "message rejected");
            if reply(connection, error_envelope(EVENT_ERROR, &error)).await.is_err() {
                writable = false;
            }
            match error {
                DispatchError::Handler { event_type, .. } => Some(event_type),
                DispatchError::Malformed | DispatchError::MissingType => None,
            }
        }
    };

    if let Some(event_type) = event_type {
        if let Err(error) = state
            .registry
            .update_state(connection_id, ConnectionState::from(event_type))
            .await
        {
            tracing::debug!(connection_id, %error, "failed to record connection state");
        }
    }
    writable
}
