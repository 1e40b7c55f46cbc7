use serde::{Deserialize, Serialize};

use crate::room::{GameState, MemberProfile, Room};

// Client -> Server event types
pub const EVENT_AUTH: &str = "auth";
pub const EVENT_PING: &str = "ping";
pub const EVENT_ROOM_CREATE: &str = "room:create";
pub const EVENT_ROOM_JOIN: &str = "room:join";
pub const EVENT_ROOM_LEAVE: &str = "room:leave";
pub const EVENT_ROOM_CHAT: &str = "room:chat";
pub const EVENT_ROOM_STATE: &str = "room:state";
pub const EVENT_ROOM_START: &str = "room:start";

// Server -> Client event types
pub const EVENT_AUTH_OK: &str = "auth:ok";
pub const EVENT_AUTH_ERROR: &str = "auth:error";
pub const EVENT_ROOM_CREATED: &str = "room:created";
pub const EVENT_ROOM_JOINED: &str = "room:joined";
pub const EVENT_ROOM_LEFT: &str = "room:left";
pub const EVENT_ROOM_STARTED: &str = "room:started";
pub const EVENT_ROOM_ERROR: &str = "room:error";
pub const EVENT_ERROR: &str = "error";

/// Only the discriminator of an inbound envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeType {
    #[serde(rename = "type", default)]
    pub event_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub token: String,
    /// Optional claimed user id; must match the token subject when present.
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreateRequest {
    #[serde(default)]
    pub room_type: String,
    #[serde(default)]
    pub max_users: Option<i64>,
}

/// Payload shared by `room:join`, `room:leave` and `room:state`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomCodeRequest {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomChatRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStartRequest {
    #[serde(default)]
    pub code: String,
    /// `null` or absent means no payload.
    #[serde(default)]
    pub game_state: Option<GameState>,
}

/// Outbound message carrying a room record. `room` serializes as `null` once
/// the room is gone; `users` is omitted when `None`.
#[derive(Debug, Serialize)]
pub struct RoomEnvelope<'a, U = String> {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub room: Option<&'a Room>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<&'a [U]>,
}

impl<'a> RoomEnvelope<'a> {
    pub fn room(event_type: &'static str, room: &'a Room) -> Self {
        Self {
            event_type,
            room: Some(room),
            users: None,
        }
    }

    pub fn with_users(event_type: &'static str, room: Option<&'a Room>, users: &'a [String]) -> Self {
        Self {
            event_type,
            room,
            users: Some(users),
        }
    }
}

impl<'a> RoomEnvelope<'a, MemberProfile> {
    pub fn with_profiles(event_type: &'static str, room: &'a Room, users: &'a [MemberProfile]) -> Self {
        Self {
            event_type,
            room: Some(room),
            users: Some(users),
        }
    }
}
