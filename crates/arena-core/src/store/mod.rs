//! Room, membership and pub/sub storage.
//!
//! Every mutating operation here is atomic in its backing: the memory store runs
//! it under one lock, the Redis store runs it as a single Lua script. Callers never
//! observe a membership set and a user's room pointer that disagree.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use arena_models::room::{GameState, MemberProfile, Room, RoomState};
use futures_util::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
    #[error("record kept changing during update")]
    Contention,
}

/// Messages received on a pub/sub channel, in publish order.
pub type MessageStream = BoxStream<'static, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertRoom {
    Created,
    CodeTaken,
    /// The creator's room pointer names another room; nothing was written.
    InOtherRoom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddMember {
    Added,
    AlreadyMember,
    Full,
    Missing,
    /// The user's room pointer names another room; they must leave it first.
    InOtherRoom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveMember {
    Removed,
    /// The user was the last member; record and membership set are gone.
    RoomDeleted,
    NotMember,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartRoom {
    Started(Room),
    Missing,
    NotMember,
    InvalidState(RoomState),
}

#[allow(async_fn_in_trait)]
pub trait RoomStore: Send + Sync {
    /// Writes the room record, adds the creator and points the creator at the
    /// room. Nothing is written if the code is taken or the creator's pointer
    /// names another room; a taken code is reported first.
    async fn insert_room(&self, room: &Room, creator: &str) -> Result<InsertRoom, StoreError>;
    async fn load_room(&self, code: &str) -> Result<Option<Room>, StoreError>;
    async fn members(&self, code: &str) -> Result<Vec<String>, StoreError>;
    /// Adds the user unless the room is missing, at its own `maxUsers` or the
    /// user's pointer names another room.
    async fn add_member(&self, code: &str, user_id: &str) -> Result<AddMember, StoreError>;
    /// Removes the member, clears their pointer if it names this room and
    /// deletes the room once it is empty. A stale pointer to a missing room,
    /// or to a room the user is not in, is cleared as well.
    async fn remove_member(&self, code: &str, user_id: &str) -> Result<RemoveMember, StoreError>;
    async fn start_room(
        &self,
        code: &str,
        user_id: &str,
        game_state: GameState,
        updated_at: i64,
    ) -> Result<StartRoom, StoreError>;
    async fn user_room(&self, user_id: &str) -> Result<Option<String>, StoreError>;
    async fn is_member(&self, code: &str, user_id: &str) -> Result<bool, StoreError>;
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError>;
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError>;
    async fn save_profile(&self, profile: &MemberProfile) -> Result<(), StoreError>;
    async fn load_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, StoreError>;
}

/// Store backing selected by configuration.
#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl Store {
    pub fn memory() -> Self {
        Store::Memory(MemoryStore::new())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Redis(_) => "redis",
        }
    }
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Store::Memory($store) => $call,
            Store::Redis($store) => $call,
        }
    };
}

impl RoomStore for Store {
    async fn insert_room(&self, room: &Room, creator: &str) -> Result<InsertRoom, StoreError> {
        delegate!(self, s => s.insert_room(room, creator).await)
    }

    async fn load_room(&self, code: &str) -> Result<Option<Room>, StoreError> {
        delegate!(self, s => s.load_room(code).await)
    }

    async fn members(&self, code: &str) -> Result<Vec<String>, StoreError> {
        delegate!(self, s => s.members(code).await)
    }

    async fn add_member(&self, code: &str, user_id: &str) -> Result<AddMember, StoreError> {
        delegate!(self, s => s.add_member(code, user_id).await)
    }

    async fn remove_member(&self, code: &str, user_id: &str) -> Result<RemoveMember, StoreError> {
        delegate!(self, s => s.remove_member(code, user_id).await)
    }

    async fn start_room(
        &self,
        code: &str,
        user_id: &str,
        game_state: GameState,
        updated_at: i64,
    ) -> Result<StartRoom, StoreError> {
        delegate!(self, s => s.start_room(code, user_id, game_state, updated_at).await)
    }

    async fn user_room(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        delegate!(self, s => s.user_room(user_id).await)
    }

    async fn is_member(&self, code: &str, user_id: &str) -> Result<bool, StoreError> {
        delegate!(self, s => s.is_member(code, user_id).await)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        delegate!(self, s => s.publish(channel, payload).await)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        delegate!(self, s => s.subscribe(channel).await)
    }

    async fn save_profile(&self, profile: &MemberProfile) -> Result<(), StoreError> {
        delegate!(self, s => s.save_profile(profile).await)
    }

    async fn load_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, StoreError> {
        delegate!(self, s => s.load_profile(user_id).await)
    }
}
