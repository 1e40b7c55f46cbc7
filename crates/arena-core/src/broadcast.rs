use std::fmt::Display;
use std::future::Future;

use arena_models::gateway::{RoomEnvelope, EVENT_ROOM_CHAT, EVENT_ROOM_STATE};
use arena_models::room::{MemberProfile, RoomSnapshot};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::profiles::ProfileCache;
use crate::store::{MessageStream, RoomStore, Store};

/// Pub/sub channel carrying a room's presence and chat events.
pub fn room_channel(code: &str) -> String {
    format!("room:chan:{code}")
}

pub fn state_envelope(snapshot: &RoomSnapshot) -> RoomEnvelope<'_> {
    RoomEnvelope::with_users(EVENT_ROOM_STATE, Some(&snapshot.room), &snapshot.users)
}

/// State sent to a caller who is not in any room.
pub fn lobby_state_envelope() -> Value {
    json!({
        "type": EVENT_ROOM_STATE,
        "room": { "state": "lobby" },
    })
}

pub fn chat_envelope(code: &str, sender: &MemberProfile, message: &str, ts: i64) -> Value {
    json!({
        "type": EVENT_ROOM_CHAT,
        "code": code,
        "from": sender.user_id,
        "message": message,
        "ts": ts,
        "username": sender.username,
        "imageUrl": sender.image_url,
    })
}

/// Fan-out of room events over the store's pub/sub channels. Delivery is
/// at-most-once; subscribers only see what is published while they listen.
#[derive(Clone)]
pub struct Broadcaster {
    store: Store,
    profiles: ProfileCache,
}

impl Broadcaster {
    pub fn new(store: Store, profiles: ProfileCache) -> Self {
        Self { store, profiles }
    }

    pub async fn publish_state(&self, snapshot: &RoomSnapshot) -> Result<(), CoreError> {
        let payload = serde_json::to_string(&state_envelope(snapshot))?;
        self.store
            .publish(&room_channel(&snapshot.room.code), payload)
            .await?;
        Ok(())
    }

    pub async fn publish_chat(&self, code: &str, from: &str, message: &str) -> Result<(), CoreError> {
        let sender = self.profiles.lookup(from).await;
        let ts = chrono::Utc::now().timestamp();
        let payload = chat_envelope(code, &sender, message, ts).to_string();
        self.store.publish(&room_channel(code), payload).await?;
        Ok(())
    }

    /// Subscribes to the room's channel. Messages published after this returns
    /// are buffered in the feed until it is forwarded.
    pub async fn open(&self, code: &str) -> Result<RoomFeed, CoreError> {
        let messages = self.store.subscribe(&room_channel(code)).await?;
        Ok(RoomFeed { messages })
    }

    /// Calls `deliver` with every payload published on the room's channel until
    /// `cancel` fires or the channel closes. A failed delivery ends the
    /// subscription.
    pub async fn subscribe<F, Fut, E>(
        &self,
        cancel: CancellationToken,
        code: &str,
        deliver: F,
    ) -> Result<(), CoreError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let feed = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            feed = self.open(code) => feed?,
        };
        feed.forward(cancel, deliver).await
    }
}

/// An open room subscription.
pub struct RoomFeed {
    messages: MessageStream,
}

impl RoomFeed {
    pub async fn forward<F, Fut, E>(
        mut self,
        cancel: CancellationToken,
        mut deliver: F,
    ) -> Result<(), CoreError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = self.messages.next() => match next {
                    Some(payload) => deliver(payload)
                        .await
                        .map_err(|e| CoreError::Delivery(e.to_string()))?,
                    None => return Ok(()),
                },
            }
        }
    }
}
