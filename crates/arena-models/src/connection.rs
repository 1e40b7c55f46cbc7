use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a gateway connection.
///
/// Besides the fixed states the registry records the type of the last event a
/// connection dispatched, which doubles as a liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Authed,
    Closed,
    Event(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authed => "authed",
            ConnectionState::Closed => "closed",
            ConnectionState::Event(event_type) => event_type,
        }
    }
}

impl From<&str> for ConnectionState {
    fn from(raw: &str) -> Self {
        match raw {
            "" | "unknown" => ConnectionState::Unknown,
            "connecting" => ConnectionState::Connecting,
            "authed" => ConnectionState::Authed,
            "closed" => ConnectionState::Closed,
            other => ConnectionState::Event(other.to_string()),
        }
    }
}

impl From<String> for ConnectionState {
    fn from(raw: String) -> Self {
        ConnectionState::from(raw.as_str())
    }
}

impl From<ConnectionState> for String {
    fn from(state: ConnectionState) -> Self {
        state.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub connection_id: String,
    /// Empty until the connection authenticates.
    pub user_id: String,
    pub state: ConnectionState,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionEntry {
    pub fn new(connection_id: &str, user_id: &str, state: ConnectionState) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            state,
            updated_at: Utc::now(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.user_id.is_empty()
    }
}
