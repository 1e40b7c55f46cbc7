use std::net::SocketAddr;
use std::time::Duration;

use arena_core::registry::{ConnectionRegistry, Registry};
use arena_core::store::Store;
use arena_core::{AppConfig, AppState};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const KEY_A_PEM: &[u8] = include_bytes!("../../arena-core/testdata/rsa_key_a.pem");
const KEY_A_N: &str = "110HZuf4Q8kYW2UOtyg0lPT-tuyv2vNUCNhMJ3zIobb4ZfPf_d-5Sjuy3BJsBO2humwILucRcxRvWy1QdbZgBTlcm2AL4aEoAQebdNQ8-LZX8mwwp0NXuayqal3ikvohaNl8lRRAy7HtWCGMDTvclePd1Pv9nIKATCKAOZR2_qHjp37mQD5g6AXSG26nSeN__BVYwWUeDrX2Bwiy404PGUuPmyMVX_VzAuNXk9TFVAnzA7qS-SJo5WXxCgJ2Stb-mBTO66K-Ha5VscOm9SbI2OvNKaccfl1-ETMJdPQ0L-yYayEKmpoJx5YQdUwuCsw7wEpUeX6AJYHaekdb5tXmcQ";
const KID: &str = "gateway-test";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    gateway: SocketAddr,
    issuer: String,
    state: AppState,
}

async fn spawn_jwks() -> String {
    let app = Router::new().route(
        "/.well-known/jwks.json",
        get(|| async {
            Json(json!({
                "keys": [{ "kid": KID, "kty": "RSA", "alg": "RS256", "n": KEY_A_N, "e": "AQAB" }]
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_gateway(idle_timeout_secs: u64) -> Harness {
    let issuer = spawn_jwks().await;
    let config = AppConfig {
        auth_issuer: issuer.clone(),
        idle_timeout_secs,
        ..Default::default()
    };
    let state = AppState::new(config, Store::memory(), Registry::local()).unwrap();
    let app = arena_ws::gateway_router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Harness {
        gateway,
        issuer,
        state,
    }
}

fn token(issuer: &str, sub: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let claims = json!({
        "iss": issuer,
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + 600,
        "username": format!("{sub}-name"),
        "imageUrl": format!("https://img.example/{sub}.png"),
    });
    encode(&header, &claims, &EncodingKey::from_rsa_pem(KEY_A_PEM).unwrap()).unwrap()
}

async fn connect(harness: &Harness) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", harness.gateway))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, message: Value) {
    socket
        .send(Message::Text(message.to_string().into()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn recv_of(socket: &mut Socket, event_type: &str) -> Value {
    loop {
        let frame = recv(socket).await;
        if frame["type"] == event_type {
            return frame;
        }
    }
}

/// Skips broadcasts until a `room:state` lists exactly `users`.
async fn recv_state_with_users(socket: &mut Socket, users: Value) -> Value {
    loop {
        let frame = recv_of(socket, "room:state").await;
        if frame["users"] == users {
            return frame;
        }
    }
}

async fn authed(harness: &Harness, user: &str) -> Socket {
    let mut socket = connect(harness).await;
    send(
        &mut socket,
        json!({"type": "auth", "token": token(&harness.issuer, user)}),
    )
    .await;
    let ok = recv(&mut socket).await;
    assert_eq!(ok["type"], "auth:ok", "auth failed: {ok}");
    recv_of(&mut socket, "room:state").await;
    socket
}

#[tokio::test]
async fn auth_binds_identity_and_reports_lobby() {
    let harness = spawn_gateway(60).await;
    let mut socket = connect(&harness).await;
    send(
        &mut socket,
        json!({"type": "auth", "token": token(&harness.issuer, "user_1"), "userId": "user_1"}),
    )
    .await;

    let ok = recv(&mut socket).await;
    assert_eq!(ok["type"], "auth:ok");
    assert_eq!(ok["userId"], "user_1");
    assert_eq!(ok["username"], "user_1-name");
    assert_eq!(ok["imageUrl"], "https://img.example/user_1.png");
    assert_eq!(ok["issuer"], harness.issuer.as_str());
    assert!(ok["exp"].as_i64().unwrap() > 0);

    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "room:state", "room": {"state": "lobby"}})
    );
}

#[tokio::test]
async fn rejected_auth_keeps_connection_usable() {
    let harness = spawn_gateway(60).await;
    let mut socket = connect(&harness).await;
    send(&mut socket, json!({"type": "auth", "token": "not-a-jwt"})).await;
    let error = recv(&mut socket).await;
    assert_eq!(error["type"], "auth:error");

    send(&mut socket, json!({"type": "room:create", "roomType": "casual"})).await;
    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "room:error", "error": "unauthorized"})
    );

    send(&mut socket, json!({"type": "ping"})).await;
    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "room:state", "room": {"state": "lobby"}})
    );
}

#[tokio::test]
async fn malformed_messages_get_generic_errors() {
    let harness = spawn_gateway(60).await;
    let mut socket = connect(&harness).await;
    socket
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "error", "error": "invalid message"})
    );
    send(&mut socket, json!({"code": "ABC234"})).await;
    assert_eq!(
        recv(&mut socket).await,
        json!({"type": "error", "error": "missing message type"})
    );
}

#[tokio::test]
async fn room_lifecycle_over_the_wire() {
    let harness = spawn_gateway(60).await;
    let mut u1 = authed(&harness, "u1").await;
    let mut u2 = authed(&harness, "u2").await;
    let mut u3 = authed(&harness, "u3").await;

    send(
        &mut u1,
        json!({"type": "room:create", "roomType": "casual", "maxUsers": 2}),
    )
    .await;
    let created = recv_of(&mut u1, "room:created").await;
    let code = created["room"]["code"].as_str().unwrap().to_string();
    assert_eq!(created["room"]["state"], "lobby");

    send(&mut u2, json!({"type": "room:join", "code": code})).await;
    let joined = recv_of(&mut u2, "room:joined").await;
    assert_eq!(joined["users"][0]["userId"], "u1");
    assert_eq!(joined["users"][0]["username"], "u1-name");
    assert_eq!(joined["users"][1]["userId"], "u2");

    let presence = recv_of(&mut u1, "room:state").await;
    assert_eq!(presence["users"], json!(["u1", "u2"]));

    send(&mut u3, json!({"type": "room:join", "code": code})).await;
    assert_eq!(
        recv(&mut u3).await,
        json!({"type": "room:error", "error": "room is full"})
    );

    send(
        &mut u1,
        json!({"type": "room:chat", "code": code, "message": "   "}),
    )
    .await;
    send(
        &mut u1,
        json!({"type": "room:chat", "code": code, "message": "hello"}),
    )
    .await;
    let chat = recv_of(&mut u2, "room:chat").await;
    assert_eq!(chat["from"], "u1");
    assert_eq!(chat["message"], "hello");
    assert_eq!(chat["code"], code.as_str());
    assert_eq!(chat["username"], "u1-name");

    send(
        &mut u1,
        json!({"type": "room:start", "code": code, "gameState": {"problem": 3}}),
    )
    .await;
    let started = recv_of(&mut u1, "room:started").await;
    assert_eq!(started["room"]["state"], "in-game");
    let broadcast = recv_of(&mut u2, "room:state").await;
    assert_eq!(broadcast["room"]["gameState"], json!({"problem": 3}));

    send(&mut u2, json!({"type": "room:leave", "code": code})).await;
    let left = recv_of(&mut u2, "room:left").await;
    assert_eq!(left["users"], json!(["u1"]));
    recv_state_with_users(&mut u1, json!(["u1"])).await;
}

#[tokio::test]
async fn state_query_by_code_needs_no_auth() {
    let harness = spawn_gateway(60).await;
    let code = harness
        .state
        .rooms
        .create("ranked", Some(4), "u1")
        .await
        .unwrap()
        .snapshot
        .room
        .code;

    let mut socket = connect(&harness).await;
    send(&mut socket, json!({"type": "room:state", "code": code.to_lowercase()})).await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["type"], "room:state");
    assert_eq!(frame["room"]["type"], "ranked");
    assert_eq!(frame["users"], json!(["u1"]));
}

#[tokio::test]
async fn closed_connections_leave_the_registry() {
    let harness = spawn_gateway(60).await;
    let mut socket = authed(&harness, "u1").await;
    assert_eq!(harness.state.registry.count().await.unwrap(), 1);

    socket.close(None).await.unwrap();
    for _ in 0..50 {
        if harness.state.registry.count().await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry entry was not removed");
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let harness = spawn_gateway(1).await;
    let mut socket = connect(&harness).await;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle connection stayed open");
}
