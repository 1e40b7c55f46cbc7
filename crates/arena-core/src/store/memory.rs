use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arena_models::room::{GameState, MemberProfile, Room, RoomState};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};

use super::{AddMember, InsertRoom, MessageStream, RemoveMember, RoomStore, StartRoom, StoreError};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Rooms {
    records: HashMap<String, Room>,
    members: HashMap<String, BTreeSet<String>>,
    user_rooms: HashMap<String, String>,
}

impl Rooms {
    fn clear_pointer_if(&mut self, user_id: &str, code: &str) {
        if self.user_rooms.get(user_id).map(String::as_str) == Some(code) {
            self.user_rooms.remove(user_id);
        }
    }
}

type Channels = Arc<DashMap<String, broadcast::Sender<String>>>;

/// Receiving end of one channel subscription. Dropping the last one removes
/// the channel.
struct Subscriber {
    rx: broadcast::Receiver<String>,
    _prune: PruneOnDrop,
}

struct PruneOnDrop {
    channels: Channels,
    channel: String,
}

impl Drop for PruneOnDrop {
    // Runs after `Subscriber::rx` is dropped, so the count excludes it.
    fn drop(&mut self) {
        self.channels
            .remove_if(&self.channel, |_, tx| tx.receiver_count() == 0);
    }
}

/// Single-process store. All room mutations run under one lock so membership
/// and room pointers always change together.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rooms: Arc<Mutex<Rooms>>,
    channels: Channels,
    profiles: Arc<DashMap<String, MemberProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomStore for MemoryStore {
    async fn insert_room(&self, room: &Room, creator: &str) -> Result<InsertRoom, StoreError> {
        let mut rooms = self.rooms.lock().await;
        if rooms.records.contains_key(&room.code) {
            return Ok(InsertRoom::CodeTaken);
        }
        if let Some(current) = rooms.user_rooms.get(creator) {
            return Ok(InsertRoom::InOtherRoom(current.clone()));
        }
        rooms.records.insert(room.code.clone(), room.clone());
        rooms
            .members
            .insert(room.code.clone(), BTreeSet::from([creator.to_string()]));
        rooms
            .user_rooms
            .insert(creator.to_string(), room.code.clone());
        Ok(InsertRoom::Created)
    }

    async fn load_room(&self, code: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.lock().await.records.get(code).cloned())
    }

    async fn members(&self, code: &str) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.lock().await;
        Ok(rooms
            .members
            .get(code)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_member(&self, code: &str, user_id: &str) -> Result<AddMember, StoreError> {
        let mut rooms = self.rooms.lock().await;
        let Some(max_users) = rooms.records.get(code).map(|room| room.max_users) else {
            return Ok(AddMember::Missing);
        };
        let (already_member, count) = rooms
            .members
            .get(code)
            .map(|set| (set.contains(user_id), set.len()))
            .unwrap_or((false, 0));
        if already_member {
            rooms
                .user_rooms
                .insert(user_id.to_string(), code.to_string());
            return Ok(AddMember::AlreadyMember);
        }
        if count >= max_users as usize {
            return Ok(AddMember::Full);
        }
        if let Some(current) = rooms.user_rooms.get(user_id) {
            if current != code {
                return Ok(AddMember::InOtherRoom(current.clone()));
            }
        }
        rooms
            .members
            .entry(code.to_string())
            .or_default()
            .insert(user_id.to_string());
        rooms
            .user_rooms
            .insert(user_id.to_string(), code.to_string());
        Ok(AddMember::Added)
    }

    async fn remove_member(&self, code: &str, user_id: &str) -> Result<RemoveMember, StoreError> {
        let mut rooms = self.rooms.lock().await;
        if !rooms.records.contains_key(code) {
            rooms.members.remove(code);
            rooms.clear_pointer_if(user_id, code);
            return Ok(RemoveMember::Missing);
        }
        let removed = rooms
            .members
            .get_mut(code)
            .map(|set| set.remove(user_id))
            .unwrap_or(false);
        rooms.clear_pointer_if(user_id, code);
        if !removed {
            return Ok(RemoveMember::NotMember);
        }
        let empty = rooms.members.get(code).is_none_or(BTreeSet::is_empty);
        if empty {
            rooms.records.remove(code);
            rooms.members.remove(code);
            return Ok(RemoveMember::RoomDeleted);
        }
        Ok(RemoveMember::Removed)
    }

    async fn start_room(
        &self,
        code: &str,
        user_id: &str,
        game_state: GameState,
        updated_at: i64,
    ) -> Result<StartRoom, StoreError> {
        let mut rooms = self.rooms.lock().await;
        let is_member = rooms
            .members
            .get(code)
            .is_some_and(|set| set.contains(user_id));
        let Some(room) = rooms.records.get_mut(code) else {
            return Ok(StartRoom::Missing);
        };
        if !is_member {
            return Ok(StartRoom::NotMember);
        }
        if !room.state.can_transition_to(RoomState::InGame) {
            return Ok(StartRoom::InvalidState(room.state));
        }
        room.state = RoomState::InGame;
        room.game_state = Some(game_state);
        room.updated_at = updated_at;
        Ok(StartRoom::Started(room.clone()))
    }

    async fn user_room(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.rooms.lock().await.user_rooms.get(user_id).cloned())
    }

    async fn is_member(&self, code: &str, user_id: &str) -> Result<bool, StoreError> {
        let rooms = self.rooms.lock().await;
        Ok(rooms
            .members
            .get(code)
            .is_some_and(|set| set.contains(user_id)))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        // Drop channels nobody listens to any more.
        if self
            .channels
            .remove_if(channel, |_, tx| tx.receiver_count() == 0)
            .is_some()
        {
            return Ok(());
        }
        if let Some(tx) = self.channels.get(channel) {
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let subscriber = Subscriber {
            rx,
            _prune: PruneOnDrop {
                channels: self.channels.clone(),
                channel: channel.to_string(),
            },
        };
        let messages = stream::unfold(subscriber, |mut subscriber| async move {
            loop {
                match subscriber.rx.recv().await {
                    Ok(payload) => return Some((payload, subscriber)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "room subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn save_profile(&self, profile: &MemberProfile) -> Result<(), StoreError> {
        self.profiles
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn load_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, StoreError> {
        Ok(self.profiles.get(user_id).map(|p| p.value().clone()))
    }
}
