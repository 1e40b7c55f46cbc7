use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Fallback capacity when neither the client nor the configuration supplies one.
pub const DEFAULT_MAX_USERS: u32 = 8;
pub const ROOM_CODE_LEN: usize = 6;
/// Room code alphabet without the easily confused `I`, `O`, `0` and `1`.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomState {
    Lobby,
    InGame,
    Ended,
}

impl RoomState {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomState::Lobby => "lobby",
            RoomState::InGame => "in-game",
            RoomState::Ended => "ended",
        }
    }

    /// Rooms only move forward: lobby -> in-game -> ended.
    pub fn can_transition_to(self, next: RoomState) -> bool {
        matches!(
            (self, next),
            (RoomState::Lobby, RoomState::InGame) | (RoomState::InGame, RoomState::Ended)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub code: String,
    #[serde(rename = "type")]
    pub room_type: String,
    pub state: RoomState,
    pub max_users: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<GameState>,
    pub updated_at: i64,
}

/// Client-supplied game payload. Stored and relayed byte for byte; the server
/// never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameState(Box<RawValue>);

impl GameState {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        RawValue::from_string(raw.to_string()).map(GameState)
    }

    /// Payload used when a game is started without one.
    pub fn empty() -> Result<Self, serde_json::Error> {
        Self::parse("{}")
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for GameState {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Room {
    pub fn new(code: String, room_type: &str, max_users: u32) -> Self {
        Self {
            code,
            room_type: room_type.trim().to_lowercase(),
            state: RoomState::Lobby,
            max_users,
            game_state: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A room record together with the ids of its current members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: Room,
    pub users: Vec<String>,
}

/// Cached profile fields for a user, used to enrich member lists and chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProfile {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub image_url: String,
}

/// Room codes are case-insensitive on input.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_serializes_with_wire_field_names() {
        let mut room = Room::new("ABC234".to_string(), " Casual ", 4);
        room.updated_at = 10;
        let value = serde_json::to_value(&room).unwrap();
        assert_eq!(value["type"], "casual");
        assert_eq!(value["state"], "lobby");
        assert_eq!(value["maxUsers"], 4);
        assert_eq!(value["updatedAt"], 10);
        assert!(value.get("gameState").is_none());
    }

    #[test]
    fn game_state_survives_a_record_round_trip_verbatim() {
        let raw = r#"{"seed":123456789012345678901234567890,"b":1,"a":[0.10]}"#;
        let mut room = Room::new("ABC234".to_string(), "casual", 4);
        room.game_state = Some(GameState::parse(raw).unwrap());

        let stored = serde_json::to_string(&room).unwrap();
        assert!(stored.contains(raw));
        let loaded: Room = serde_json::from_str(&stored).unwrap();
        assert_eq!(loaded.game_state.as_ref().map(GameState::as_str), Some(raw));
        assert_eq!(loaded, room);
    }

    #[test]
    fn invalid_game_state_is_rejected() {
        assert!(GameState::parse("{not json").is_err());
        assert_eq!(GameState::empty().unwrap().as_str(), "{}");
    }

    #[test]
    fn in_game_state_uses_kebab_case() {
        assert_eq!(
            serde_json::to_value(RoomState::InGame).unwrap(),
            serde_json::json!("in-game")
        );
        assert_eq!(RoomState::InGame.as_str(), "in-game");
    }

    #[test]
    fn state_machine_is_forward_only() {
        assert!(RoomState::Lobby.can_transition_to(RoomState::InGame));
        assert!(RoomState::InGame.can_transition_to(RoomState::Ended));
        assert!(!RoomState::InGame.can_transition_to(RoomState::Lobby));
        assert!(!RoomState::Ended.can_transition_to(RoomState::Lobby));
        assert!(!RoomState::Lobby.can_transition_to(RoomState::Lobby));
    }

    #[test]
    fn codes_are_normalized_to_uppercase() {
        assert_eq!(normalize_code(" abc23x "), "ABC23X");
    }

    #[test]
    fn alphabet_has_no_confusable_characters() {
        for ch in [b'I', b'O', b'0', b'1'] {
            assert!(!ROOM_CODE_ALPHABET.contains(&ch));
        }
    }
}
