use arena_core::broadcast::{lobby_state_envelope, state_envelope};
use arena_core::error::CoreError;
use arena_core::rooms::LeaveOutcome;
use arena_models::gateway::*;
use serde::de::DeserializeOwned;

use super::{
    authenticated_user, deliver_room_state, error_envelope, reply, start_forwarding,
};
use crate::dispatcher::{EventContext, HandlerFuture};

fn parse<T: DeserializeOwned>(raw: &str) -> Result<T, CoreError> {
    serde_json::from_str(raw).map_err(|e| CoreError::BadRequest(e.to_string()))
}

fn required_code(code: Option<String>) -> Result<String, CoreError> {
    code.filter(|c| !c.trim().is_empty())
        .ok_or_else(|| CoreError::BadRequest("missing room code".into()))
}

async fn require_user(ctx: &EventContext<'_>) -> Result<String, CoreError> {
    authenticated_user(ctx)
        .await?
        .ok_or(CoreError::Unauthorized)
}

/// Turns a failed room operation into a `room:error` reply. Only transport
/// failures propagate.
async fn room_error(ctx: &EventContext<'_>, error: CoreError) -> Result<bool, CoreError> {
    if matches!(error, CoreError::Delivery(_)) {
        return Err(error);
    }
    let message = match &error {
        CoreError::Store(_) | CoreError::Encode(_) => {
            tracing::error!(connection_id = ctx.connection_id, %error, "room operation failed");
            "internal error".to_string()
        }
        other => other.to_string(),
    };
    reply(ctx.connection, error_envelope(EVENT_ROOM_ERROR, message)).await?;
    Ok(true)
}

macro_rules! room_handler {
    ($name:ident, $op:ident) => {
        pub(super) fn $name(ctx: EventContext<'_>) -> HandlerFuture<'_> {
            Box::pin(async move {
                match $op(&ctx).await {
                    Ok(()) => Ok(true),
                    Err(error) => room_error(&ctx, error).await,
                }
            })
        }
    };
}

room_handler!(handle_create, create);
room_handler!(handle_join, join);
room_handler!(handle_leave, leave);
room_handler!(handle_chat, chat);
room_handler!(handle_state, room_state);
room_handler!(handle_start, start);

async fn create(ctx: &EventContext<'_>) -> Result<(), CoreError> {
    let user_id = require_user(ctx).await?;
    let request: RoomCreateRequest = parse(ctx.raw)?;
    let outcome = ctx
        .state
        .rooms
        .create(&request.room_type, request.max_users, &user_id)
        .await?;
    if let Some(left) = &outcome.left {
        ctx.connection.end_subscription(left);
    }
    start_forwarding(ctx.state, ctx.connection, &outcome.snapshot.room.code).await;
    reply(
        ctx.connection,
        RoomEnvelope::room(EVENT_ROOM_CREATED, &outcome.snapshot.room),
    )
    .await
}

async fn join(ctx: &EventContext<'_>) -> Result<(), CoreError> {
    let user_id = require_user(ctx).await?;
    let request: RoomCodeRequest = parse(ctx.raw)?;
    let code = required_code(request.code)?;
    let outcome = ctx.state.rooms.join(&code, &user_id).await?;
    if let Some(left) = &outcome.left {
        ctx.connection.end_subscription(left);
    }
    let code = outcome.snapshot.room.code.clone();
    start_forwarding(ctx.state, ctx.connection, &code).await;
    let users = ctx
        .state
        .rooms
        .members_with_profiles(&outcome.snapshot.users)
        .await;
    reply(
        ctx.connection,
        RoomEnvelope::with_profiles(EVENT_ROOM_JOINED, &outcome.snapshot.room, &users),
    )
    .await
}

async fn leave(ctx: &EventContext<'_>) -> Result<(), CoreError> {
    let user_id = require_user(ctx).await?;
    let request: RoomCodeRequest = parse(ctx.raw)?;
    let code = required_code(request.code)?;
    let outcome = ctx.state.rooms.leave(&code, &user_id).await?;
    ctx.connection
        .end_subscription(&arena_models::room::normalize_code(&code));
    match outcome {
        LeaveOutcome::Remaining(snapshot) => {
            let envelope =
                RoomEnvelope::with_users(EVENT_ROOM_LEFT, Some(&snapshot.room), &snapshot.users);
            reply(ctx.connection, envelope).await
        }
        LeaveOutcome::Deleted => {
            reply(ctx.connection, RoomEnvelope::with_users(EVENT_ROOM_LEFT, None, &[])).await
        }
    }
}

async fn chat(ctx: &EventContext<'_>) -> Result<(), CoreError> {
    let user_id = require_user(ctx).await?;
    let request: RoomChatRequest = parse(ctx.raw)?;
    let code = required_code(Some(request.code))?;
    ctx.state
        .rooms
        .chat(&code, &user_id, &request.message)
        .await?;
    Ok(())
}

/// With a code this is a plain lookup open to anyone. Without one it reports
/// the caller's own room, or the lobby.
async fn room_state(ctx: &EventContext<'_>) -> Result<(), CoreError> {
    let request: RoomCodeRequest = parse(ctx.raw)?;
    if let Some(code) = request.code.filter(|c| !c.trim().is_empty()) {
        let snapshot = ctx.state.rooms.query(&code).await?;
        return reply(ctx.connection, state_envelope(&snapshot)).await;
    }
    match authenticated_user(ctx).await? {
        Some(user_id) => deliver_room_state(ctx.state, ctx.connection, &user_id).await,
        None => reply(ctx.connection, lobby_state_envelope()).await,
    }
}

async fn start(ctx: &EventContext<'_>) -> Result<(), CoreError> {
    let user_id = require_user(ctx).await?;
    let request: RoomStartRequest = parse(ctx.raw)?;
    let code = required_code(Some(request.code))?;
    let snapshot = ctx
        .state
        .rooms
        .start(&code, &user_id, request.game_state)
        .await?;
    reply(
        ctx.connection,
        RoomEnvelope::room(EVENT_ROOM_STARTED, &snapshot.room),
    )
    .await
}
