use std::sync::LazyLock;

use arena_models::room::{GameState, MemberProfile, Room, RoomState};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{AddMember, InsertRoom, MessageStream, RemoveMember, RoomStore, StartRoom, StoreError};

const USERNAMES_KEY: &str = "usernames";
const IMAGE_URLS_KEY: &str = "user_image_urls";
const START_ATTEMPTS: usize = 5;

fn room_key(code: &str) -> String {
    format!("room:{code}")
}

fn members_key(code: &str) -> String {
    format!("room:users:{code}")
}

fn pointer_key(user_id: &str) -> String {
    format!("user:room:{user_id}")
}

// KEYS: room, members, creator pointer. ARGV: room json, creator, code.
static CREATE_ROOM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 'taken'
end
local current = redis.call('GET', KEYS[3])
if current then
  return 'other:' .. current
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SET', KEYS[3], ARGV[3])
return 'created'
",
    )
});

// KEYS: room, members, user pointer. ARGV: user, code.
static ADD_MEMBER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 'missing'
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  redis.call('SET', KEYS[3], ARGV[2])
  return 'member'
end
local max_users = tonumber(cjson.decode(raw)['maxUsers']) or 0
if redis.call('SCARD', KEYS[2]) >= max_users then
  return 'full'
end
local current = redis.call('GET', KEYS[3])
if current and current ~= ARGV[2] then
  return 'other:' .. current
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2])
return 'added'
",
    )
});

// KEYS: room, members, user pointer. ARGV: user, code.
static REMOVE_MEMBER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local function clear_pointer()
  if redis.call('GET', KEYS[3]) == ARGV[2] then
    redis.call('DEL', KEYS[3])
  end
end
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[2])
  clear_pointer()
  return 'missing'
end
local removed = redis.call('SREM', KEYS[2], ARGV[1])
clear_pointer()
if removed == 0 then
  return 'not-member'
end
if redis.call('SCARD', KEYS[2]) == 0 then
  redis.call('DEL', KEYS[1], KEYS[2])
  return 'deleted'
end
return 'removed'
",
    )
});

// Compare-and-swap of the room record. KEYS: room, members.
// ARGV: user, expected json, replacement json.
static START_ROOM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if not current then
  return 'missing'
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then
  return 'not-member'
end
if current ~= ARGV[2] then
  return 'changed'
end
redis.call('SET', KEYS[1], ARGV[3])
return 'ok'
",
    )
});

/// Shared store. Room records are JSON strings under `room:<CODE>`, members a
/// set under `room:users:<CODE>` and each user's room pointer a string under
/// `user:room:<id>`.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Connection manager shared with the connection registry.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl RoomStore for RedisStore {
    async fn insert_room(&self, room: &Room, creator: &str) -> Result<InsertRoom, StoreError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(room)?;
        let reply = CREATE_ROOM
            .key(room_key(&room.code))
            .key(members_key(&room.code))
            .key(pointer_key(creator))
            .arg(raw)
            .arg(creator)
            .arg(&room.code)
            .invoke_async::<_, String>(&mut conn)
            .await?;
        match reply.as_str() {
            "created" => Ok(InsertRoom::Created),
            "taken" => Ok(InsertRoom::CodeTaken),
            other => match other.strip_prefix("other:") {
                Some(current) => Ok(InsertRoom::InOtherRoom(current.to_string())),
                None => Err(StoreError::UnexpectedReply(reply)),
            },
        }
    }

    async fn load_room(&self, code: &str) -> Result<Option<Room>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(room_key(code)).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn members(&self, code: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(members_key(code)).await?)
    }

    async fn add_member(&self, code: &str, user_id: &str) -> Result<AddMember, StoreError> {
        let mut conn = self.conn.clone();
        let reply = ADD_MEMBER
            .key(room_key(code))
            .key(members_key(code))
            .key(pointer_key(user_id))
            .arg(user_id)
            .arg(code)
            .invoke_async::<_, String>(&mut conn)
            .await?;
        match reply.as_str() {
            "added" => Ok(AddMember::Added),
            "member" => Ok(AddMember::AlreadyMember),
            "full" => Ok(AddMember::Full),
            "missing" => Ok(AddMember::Missing),
            other => match other.strip_prefix("other:") {
                Some(current) => Ok(AddMember::InOtherRoom(current.to_string())),
                None => Err(StoreError::UnexpectedReply(reply)),
            },
        }
    }

    async fn remove_member(&self, code: &str, user_id: &str) -> Result<RemoveMember, StoreError> {
        let mut conn = self.conn.clone();
        let reply = REMOVE_MEMBER
            .key(room_key(code))
            .key(members_key(code))
            .key(pointer_key(user_id))
            .arg(user_id)
            .arg(code)
            .invoke_async::<_, String>(&mut conn)
            .await?;
        match reply.as_str() {
            "removed" => Ok(RemoveMember::Removed),
            "deleted" => Ok(RemoveMember::RoomDeleted),
            "not-member" => Ok(RemoveMember::NotMember),
            "missing" => Ok(RemoveMember::Missing),
            _ => Err(StoreError::UnexpectedReply(reply)),
        }
    }

    async fn start_room(
        &self,
        code: &str,
        user_id: &str,
        game_state: GameState,
        updated_at: i64,
    ) -> Result<StartRoom, StoreError> {
        let mut conn = self.conn.clone();
        for _ in 0..START_ATTEMPTS {
            let current: Option<String> = conn.get(room_key(code)).await?;
            let Some(current) = current else {
                return Ok(StartRoom::Missing);
            };
            if !self.is_member(code, user_id).await? {
                return Ok(StartRoom::NotMember);
            }
            let mut room: Room = serde_json::from_str(&current)?;
            if !room.state.can_transition_to(RoomState::InGame) {
                return Ok(StartRoom::InvalidState(room.state));
            }
            room.state = RoomState::InGame;
            room.game_state = Some(game_state.clone());
            room.updated_at = updated_at;
            let next = serde_json::to_string(&room)?;

            let reply = START_ROOM
                .key(room_key(code))
                .key(members_key(code))
                .arg(user_id)
                .arg(&current)
                .arg(next)
                .invoke_async::<_, String>(&mut conn)
                .await?;
            match reply.as_str() {
                "ok" => return Ok(StartRoom::Started(room)),
                "missing" => return Ok(StartRoom::Missing),
                "not-member" => return Ok(StartRoom::NotMember),
                "changed" => continue,
                _ => return Err(StoreError::UnexpectedReply(reply)),
            }
        }
        Err(StoreError::Contention)
    }

    async fn user_room(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(pointer_key(user_id)).await?)
    }

    async fn is_member(&self, code: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(members_key(code), user_id).await?)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        // Pub/sub needs its own connection; the manager is multiplexed.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        tracing::warn!(%error, "dropping undecodable pub/sub payload");
                        None
                    }
                }
            });
        Ok(messages.boxed())
    }

    async fn save_profile(&self, profile: &MemberProfile) -> Result<(), StoreError> {
        if profile.username.is_empty() && profile.image_url.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !profile.username.is_empty() {
            pipe.hset(USERNAMES_KEY, &profile.user_id, &profile.username)
                .ignore();
        }
        if !profile.image_url.is_empty() {
            pipe.hset(IMAGE_URLS_KEY, &profile.user_id, &profile.image_url)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn load_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, StoreError> {
        let mut conn = self.conn.clone();
        let (username, image_url): (Option<String>, Option<String>) = redis::pipe()
            .hget(USERNAMES_KEY, user_id)
            .hget(IMAGE_URLS_KEY, user_id)
            .query_async(&mut conn)
            .await?;
        if username.is_none() && image_url.is_none() {
            return Ok(None);
        }
        Ok(Some(MemberProfile {
            user_id: user_id.to_string(),
            username: username.unwrap_or_default(),
            image_url: image_url.unwrap_or_default(),
        }))
    }
}
