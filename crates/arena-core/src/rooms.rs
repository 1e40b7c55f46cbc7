//! Room lifecycle: creation, membership, game start and chat.
//!
//! The store is the source of truth. Each membership change is a single atomic
//! store operation; the coordinator only sequences them and announces the
//! resulting state on the room channel.

use arena_models::room::{
    normalize_code, GameState, MemberProfile, Room, RoomSnapshot, DEFAULT_MAX_USERS,
    ROOM_CODE_ALPHABET, ROOM_CODE_LEN,
};
use rand::Rng;

use crate::broadcast::Broadcaster;
use crate::error::CoreError;
use crate::profiles::ProfileCache;
use crate::store::{AddMember, InsertRoom, RemoveMember, RoomStore, StartRoom, Store, StoreError};

const CODE_ATTEMPTS: usize = 5;
const JOIN_ATTEMPTS: usize = 3;

/// Result of `create` and `join`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub snapshot: RoomSnapshot,
    /// Room the user had to leave first, if any.
    pub left: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaveOutcome {
    Remaining(RoomSnapshot),
    /// The user was the last member and the room no longer exists.
    Deleted,
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

pub struct RoomCoordinator {
    store: Store,
    broadcaster: Broadcaster,
    profiles: ProfileCache,
    default_max_users: u32,
}

impl RoomCoordinator {
    pub fn new(store: Store, profiles: ProfileCache, default_max_users: u32) -> Self {
        let default_max_users = if default_max_users == 0 {
            DEFAULT_MAX_USERS
        } else {
            default_max_users
        };
        Self {
            broadcaster: Broadcaster::new(store.clone(), profiles.clone()),
            store,
            profiles,
            default_max_users,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub async fn create(
        &self,
        room_type: &str,
        max_users: Option<i64>,
        creator: &str,
    ) -> Result<JoinOutcome, CoreError> {
        self.create_with(room_type, max_users, creator, generate_code)
            .await
    }

    /// `create` with an injectable code source. The creator's current room is
    /// only left once a free code has been found for the new one.
    pub async fn create_with(
        &self,
        room_type: &str,
        max_users: Option<i64>,
        creator: &str,
        mut next_code: impl FnMut() -> String,
    ) -> Result<JoinOutcome, CoreError> {
        if creator.is_empty() {
            return Err(CoreError::Unauthorized);
        }
        let max_users = match max_users {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => self.default_max_users,
        };

        let mut left = None;
        let mut code = next_code();
        let mut codes_tried = 1;
        let mut leaves = 0;
        loop {
            let room = Room::new(code.clone(), room_type, max_users);
            match self.store.insert_room(&room, creator).await? {
                InsertRoom::Created => {
                    tracing::info!(code = %room.code, user_id = creator, max_users, "room created");
                    let snapshot = RoomSnapshot {
                        room,
                        users: vec![creator.to_string()],
                    };
                    self.announce(&snapshot).await;
                    return Ok(JoinOutcome { snapshot, left });
                }
                InsertRoom::CodeTaken => {
                    if codes_tried >= CODE_ATTEMPTS {
                        return Err(CoreError::CodeAllocation);
                    }
                    tracing::debug!(code = %room.code, "room code taken, retrying");
                    code = next_code();
                    codes_tried += 1;
                }
                InsertRoom::InOtherRoom(other) => {
                    if leaves >= JOIN_ATTEMPTS {
                        return Err(StoreError::Contention.into());
                    }
                    self.leave_stale(&other, creator).await?;
                    left = Some(other);
                    leaves += 1;
                }
            }
        }
    }

    /// Joins `code`, leaving the user's current room first. Joining a room the
    /// user is already in succeeds without changes.
    pub async fn join(&self, code: &str, user_id: &str) -> Result<JoinOutcome, CoreError> {
        if user_id.is_empty() {
            return Err(CoreError::Unauthorized);
        }
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(CoreError::BadRequest("missing room code".into()));
        }

        let mut left = None;
        for _ in 0..JOIN_ATTEMPTS {
            match self.store.add_member(&code, user_id).await? {
                AddMember::Added => {
                    let snapshot = self.query(&code).await?;
                    tracing::info!(code = %code, user_id, "joined room");
                    self.announce(&snapshot).await;
                    return Ok(JoinOutcome { snapshot, left });
                }
                AddMember::AlreadyMember => {
                    let snapshot = self.query(&code).await?;
                    return Ok(JoinOutcome { snapshot, left });
                }
                AddMember::Full => return Err(CoreError::RoomFull),
                AddMember::Missing => return Err(CoreError::NotFound),
                AddMember::InOtherRoom(other) => {
                    self.leave_stale(&other, user_id).await?;
                    left = Some(other);
                }
            }
        }
        Err(StoreError::Contention.into())
    }

    pub async fn leave(&self, code: &str, user_id: &str) -> Result<LeaveOutcome, CoreError> {
        if user_id.is_empty() {
            return Err(CoreError::Unauthorized);
        }
        let code = normalize_code(code);
        match self.store.remove_member(&code, user_id).await? {
            RemoveMember::Missing => Err(CoreError::NotFound),
            RemoveMember::NotMember => Err(CoreError::NotMember),
            RemoveMember::RoomDeleted => {
                tracing::info!(code = %code, user_id, "last member left, room deleted");
                Ok(LeaveOutcome::Deleted)
            }
            RemoveMember::Removed => {
                tracing::info!(code = %code, user_id, "left room");
                match self.query(&code).await {
                    Ok(snapshot) => {
                        self.announce(&snapshot).await;
                        Ok(LeaveOutcome::Remaining(snapshot))
                    }
                    // The remaining members left in the meantime.
                    Err(CoreError::NotFound) => Ok(LeaveOutcome::Deleted),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Moves the room from lobby to in-game. A missing `game_state` is stored as
    /// an empty object.
    pub async fn start(
        &self,
        code: &str,
        user_id: &str,
        game_state: Option<GameState>,
    ) -> Result<RoomSnapshot, CoreError> {
        if user_id.is_empty() {
            return Err(CoreError::Unauthorized);
        }
        let code = normalize_code(code);
        let game_state = match game_state {
            Some(game_state) => game_state,
            None => GameState::empty()?,
        };
        let now = chrono::Utc::now().timestamp();
        match self.store.start_room(&code, user_id, game_state, now).await? {
            StartRoom::Started(room) => {
                let mut users = self.store.members(&code).await?;
                users.sort();
                let snapshot = RoomSnapshot { room, users };
                tracing::info!(code = %code, user_id, "game started");
                self.announce(&snapshot).await;
                Ok(snapshot)
            }
            StartRoom::Missing => Err(CoreError::NotFound),
            StartRoom::NotMember => Err(CoreError::NotMember),
            StartRoom::InvalidState(state) => Err(CoreError::InvalidTransition(format!(
                "room is {}",
                state.as_str()
            ))),
        }
    }

    /// Room record with its members sorted by id.
    pub async fn query(&self, code: &str) -> Result<RoomSnapshot, CoreError> {
        let code = normalize_code(code);
        let room = self
            .store
            .load_room(&code)
            .await?
            .ok_or(CoreError::NotFound)?;
        let mut users = self.store.members(&code).await?;
        users.sort();
        Ok(RoomSnapshot { room, users })
    }

    pub async fn user_room(&self, user_id: &str) -> Result<Option<String>, CoreError> {
        Ok(self.store.user_room(user_id).await?)
    }

    pub async fn is_member(&self, code: &str, user_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.is_member(&normalize_code(code), user_id).await?)
    }

    /// Broadcasts a chat line. Returns `false` when the message is blank and
    /// nothing was sent.
    pub async fn chat(&self, code: &str, user_id: &str, message: &str) -> Result<bool, CoreError> {
        if user_id.is_empty() {
            return Err(CoreError::Unauthorized);
        }
        if message.trim().is_empty() {
            return Ok(false);
        }
        let code = normalize_code(code);
        if !self.store.is_member(&code, user_id).await? {
            return Err(CoreError::NotMember);
        }
        self.broadcaster.publish_chat(&code, user_id, message).await?;
        Ok(true)
    }

    pub async fn members_with_profiles(&self, users: &[String]) -> Vec<MemberProfile> {
        self.profiles.enrich(users).await
    }

    /// Leaves a room the user's pointer names. A pointer to a room that is gone
    /// or no longer lists the user was cleared by the store already.
    async fn leave_stale(&self, code: &str, user_id: &str) -> Result<(), CoreError> {
        match self.leave(code, user_id).await {
            Ok(_) | Err(CoreError::NotFound) | Err(CoreError::NotMember) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn announce(&self, snapshot: &RoomSnapshot) {
        if let Err(error) = self.broadcaster.publish_state(snapshot).await {
            tracing::warn!(code = %snapshot.room.code, %error, "failed to publish room state");
        }
    }
}
