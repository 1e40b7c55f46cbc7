//! Runs the Redis-backed store and registry against a live server.
//!
//! Set `REDIS_URL` (for example `redis://127.0.0.1:6379`) to run these; without
//! it every test returns early. Codes and ids are random so runs do not collide.

use std::time::Duration;

use arena_core::registry::{ConnectionRegistry, SharedRegistry};
use arena_core::rooms::generate_code;
use arena_core::store::{AddMember, InsertRoom, RedisStore, RemoveMember, RoomStore, StartRoom};
use arena_models::connection::ConnectionState;
use arena_models::room::{GameState, Room, RoomState};
use futures_util::StreamExt;

async fn store() -> Option<RedisStore> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return None;
    };
    Some(RedisStore::connect(&url).await.expect("connect to REDIS_URL"))
}

fn user() -> String {
    format!("user-{}", generate_code())
}

fn room(max_users: u32) -> Room {
    Room::new(generate_code(), "duel", max_users)
}

#[tokio::test]
async fn create_writes_only_when_code_is_free() {
    let Some(store) = store().await else { return };
    let first = room(4);
    let (u1, u2) = (user(), user());

    assert_eq!(store.insert_room(&first, &u1).await.unwrap(), InsertRoom::Created);
    assert_eq!(store.members(&first.code).await.unwrap(), vec![u1.clone()]);
    assert_eq!(store.user_room(&u1).await.unwrap(), Some(first.code.clone()));

    let clash = Room::new(first.code.clone(), "race", 8);
    assert_eq!(store.insert_room(&clash, &u2).await.unwrap(), InsertRoom::CodeTaken);
    let stored = store.load_room(&first.code).await.unwrap().unwrap();
    assert_eq!(stored.room_type, "duel");
    assert_eq!(store.user_room(&u2).await.unwrap(), None);

    store.remove_member(&first.code, &u1).await.unwrap();
}

#[tokio::test]
async fn create_refuses_creator_with_pointer_elsewhere() {
    let Some(store) = store().await else { return };
    let u1 = user();
    let current = room(4);
    store.insert_room(&current, &u1).await.unwrap();

    let next = room(4);
    assert_eq!(
        store.insert_room(&next, &u1).await.unwrap(),
        InsertRoom::InOtherRoom(current.code.clone())
    );
    assert!(store.load_room(&next.code).await.unwrap().is_none());
    assert_eq!(store.user_room(&u1).await.unwrap(), Some(current.code.clone()));

    // A taken code wins over the pointer check.
    let taken = Room::new(current.code.clone(), "duel", 4);
    assert_eq!(store.insert_room(&taken, &u1).await.unwrap(), InsertRoom::CodeTaken);

    store.remove_member(&current.code, &u1).await.unwrap();
}

#[tokio::test]
async fn join_respects_capacity_and_other_rooms() {
    let Some(store) = store().await else { return };
    let (u1, u2, u3) = (user(), user(), user());
    let small = room(2);
    store.insert_room(&small, &u1).await.unwrap();

    assert_eq!(store.add_member(&small.code, &u2).await.unwrap(), AddMember::Added);
    assert_eq!(store.add_member(&small.code, &u2).await.unwrap(), AddMember::AlreadyMember);
    assert_eq!(store.add_member(&small.code, &u3).await.unwrap(), AddMember::Full);
    assert_eq!(store.user_room(&u3).await.unwrap(), None);

    let other = room(4);
    store.insert_room(&other, &u3).await.unwrap();
    store.remove_member(&small.code, &u2).await.unwrap();
    assert_eq!(
        store.add_member(&small.code, &u3).await.unwrap(),
        AddMember::InOtherRoom(other.code.clone())
    );
    assert!(!store.is_member(&small.code, &u3).await.unwrap());

    assert_eq!(store.add_member("ZZZZZZ-missing", &u2).await.unwrap(), AddMember::Missing);

    store.remove_member(&small.code, &u1).await.unwrap();
    store.remove_member(&other.code, &u3).await.unwrap();
}

#[tokio::test]
async fn last_leave_deletes_the_room() {
    let Some(store) = store().await else { return };
    let (u1, u2) = (user(), user());
    let r = room(4);
    store.insert_room(&r, &u1).await.unwrap();
    store.add_member(&r.code, &u2).await.unwrap();

    assert_eq!(store.remove_member(&r.code, &u1).await.unwrap(), RemoveMember::Removed);
    assert_eq!(store.user_room(&u1).await.unwrap(), None);
    assert_eq!(store.remove_member(&r.code, &u1).await.unwrap(), RemoveMember::NotMember);
    assert_eq!(store.remove_member(&r.code, &u2).await.unwrap(), RemoveMember::RoomDeleted);

    assert!(store.load_room(&r.code).await.unwrap().is_none());
    assert!(store.members(&r.code).await.unwrap().is_empty());
    assert_eq!(store.user_room(&u2).await.unwrap(), None);
    assert_eq!(store.remove_member(&r.code, &u2).await.unwrap(), RemoveMember::Missing);
}

#[tokio::test]
async fn start_swaps_state_once_and_keeps_game_state_bytes() {
    let Some(store) = store().await else { return };
    let (u1, outsider) = (user(), user());
    let r = room(4);
    store.insert_room(&r, &u1).await.unwrap();

    let raw = r#"{"seed":123456789012345678901234567890,"mode":"ranked"}"#;
    let game_state = GameState::parse(raw).unwrap();
    assert_eq!(
        store.start_room(&r.code, &outsider, game_state.clone(), 1).await.unwrap(),
        StartRoom::NotMember
    );

    let started = match store.start_room(&r.code, &u1, game_state.clone(), 2).await.unwrap() {
        StartRoom::Started(room) => room,
        other => panic!("expected start, got {other:?}"),
    };
    assert_eq!(started.state, RoomState::InGame);

    let stored = store.load_room(&r.code).await.unwrap().unwrap();
    assert_eq!(stored.state, RoomState::InGame);
    assert_eq!(stored.game_state.as_ref().map(GameState::as_str), Some(raw));
    assert_eq!(stored.updated_at, 2);

    assert_eq!(
        store.start_room(&r.code, &u1, game_state, 3).await.unwrap(),
        StartRoom::InvalidState(RoomState::InGame)
    );

    store.remove_member(&r.code, &u1).await.unwrap();
}

#[tokio::test]
async fn published_messages_reach_subscribers_in_order() {
    let Some(store) = store().await else { return };
    let channel = format!("room:{}", generate_code());
    let mut messages = store.subscribe(&channel).await.unwrap();

    store.publish(&channel, "one".to_string()).await.unwrap();
    store.publish(&channel, "two".to_string()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        vec![messages.next().await, messages.next().await]
    })
    .await
    .unwrap();
    assert_eq!(received, vec![Some("one".to_string()), Some("two".to_string())]);
}

#[tokio::test]
async fn shared_registry_tracks_entries() {
    let Some(store) = store().await else { return };
    let registry = SharedRegistry::new(store.connection(), Duration::from_secs(30));
    let connection_id = format!("test-{}", generate_code());

    registry
        .set(&connection_id, "u1", ConnectionState::Authed)
        .await
        .unwrap();
    registry
        .update_state(&connection_id, ConnectionState::from("room:join"))
        .await
        .unwrap();
    let entry = registry.get(&connection_id).await.unwrap().unwrap();
    assert_eq!(entry.user_id, "u1");
    assert_eq!(entry.state, ConnectionState::Event("room:join".into()));
    assert!(registry.count().await.unwrap() >= 1);

    registry.delete(&connection_id).await.unwrap();
    assert!(registry.get(&connection_id).await.unwrap().is_none());
}

#[tokio::test]
async fn shared_registry_update_creates_missing_entry() {
    let Some(store) = store().await else { return };
    let registry = SharedRegistry::new(store.connection(), Duration::from_secs(30));
    let connection_id = format!("test-{}", generate_code());

    registry
        .update_state(&connection_id, ConnectionState::Connecting)
        .await
        .unwrap();
    let entry = registry.get(&connection_id).await.unwrap().unwrap();
    assert_eq!(entry.user_id, "");
    assert!(!entry.is_authenticated());
    assert_eq!(entry.state, ConnectionState::Connecting);

    let mut conn = store.connection();
    let ttl: i64 = redis::cmd("TTL")
        .arg(format!("conn:{connection_id}"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 30);

    registry.delete(&connection_id).await.unwrap();
}
