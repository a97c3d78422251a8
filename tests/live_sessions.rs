// Live sessions: the WebSocket endpoint, and how REST stat writes interact
// with a session that owns the pet's stats.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{setup, TestApp};
use tamagotchi_backend::db::Database;
use tamagotchi_backend::pet::decay::DecayRates;
use tamagotchi_backend::pet::session::{PetSession, SessionTimers};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn timers(sync_ms: u64) -> SessionTimers {
    SessionTimers {
        decay_interval: Duration::from_secs(3600),
        sync_interval: Duration::from_millis(sync_ms),
        rates: DecayRates::default(),
    }
}

fn dead_snapshot() -> Value {
    json!({ "hunger": 0, "happiness": 0, "energy": 0, "hygiene": 0, "health": 0 })
}

async fn start_session(t: &TestApp, pet_id: i64, sync_ms: u64) -> PetSession {
    let pet = t.db.get_pet(pet_id).await.unwrap().unwrap();
    let slot = t.sessions.try_acquire(pet_id).unwrap();
    PetSession::start(t.db.clone(), &pet, slot, timers(sync_ms))
}

async fn death_memories(db: &Arc<Database>, pet_id: i64) -> usize {
    db.recent_memories(pet_id, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.content.contains("passed away"))
        .count()
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// HTTP status of a refused WebSocket handshake.
async fn refused_status(url: &str) -> u16 {
    match connect_async(url).await {
        Err(WsError::Http(resp)) => resp.status().as_u16(),
        Err(e) => panic!("unexpected handshake error: {e}"),
        Ok(_) => panic!("handshake unexpectedly accepted"),
    }
}

// ── REST writes during a session ─────────────────────────────────────

#[tokio::test]
async fn test_rest_stat_writes_refused_during_live_session() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;
    let session = start_session(&t, pet_id, 50).await;

    for (uri, body) in [
        (format!("/api/pet/{pet_id}/action"), Some(json!({ "action": "feed" }))),
        (
            format!("/api/pet/{pet_id}/sync"),
            Some(json!({ "hunger": 10, "happiness": 10, "energy": 10, "hygiene": 10, "health": 10 })),
        ),
        (format!("/api/pet/{pet_id}/restart"), None),
    ] {
        let (status, err) = t.request("POST", &uri, Some(&token), body).await;
        assert_eq!(status, StatusCode::CONFLICT, "{uri}");
        assert_eq!(err["error"], "conflict");
    }

    // Changes made through the session are what the sync timer persists
    let state = session
        .act(tamagotchi_backend::pet::actions::Action::Feed)
        .await
        .unwrap();
    assert_eq!(state.stats.hunger, 100);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = t.db.get_pet(pet_id).await.unwrap().unwrap();
    assert_eq!(stored.stats.hunger, 100);

    session.shutdown().await;

    let (status, pet) = t
        .request(
            "POST",
            &format!("/api/pet/{pet_id}/action"),
            Some(&token),
            Some(json!({ "action": "clean" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pet["hunger"], 100);
    assert_eq!(pet["hygiene"], 100);
}

#[tokio::test]
async fn test_restart_during_live_session_is_not_undone() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;
    let (status, dead) = t
        .request("POST", &format!("/api/pet/{pet_id}/sync"), Some(&token), Some(dead_snapshot()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dead["alive"], false);

    let session = start_session(&t, pet_id, 50).await;

    let (status, _) = t
        .request("POST", &format!("/api/pet/{pet_id}/restart"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let state = session.restart().await.unwrap();
    assert!(state.alive);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = t.db.get_pet(pet_id).await.unwrap().unwrap();
    assert!(stored.alive);
    assert_eq!(stored.generation, 2);
    assert_eq!(stored.stats.health, 100);
    assert_eq!(death_memories(&t.db, pet_id).await, 1);

    session.shutdown().await;
}

// ── WebSocket endpoint ───────────────────────────────────────────────

#[tokio::test]
async fn test_ws_requires_valid_token_and_access() {
    let t = setup().await;
    let (_, _, pet_id) = t.owner_with_pet("alice").await;
    let (_, stranger) = t.user("mallory").await;
    let addr = t.serve().await;

    assert_eq!(refused_status(&format!("ws://{addr}/ws/pet/{pet_id}")).await, 401);
    assert_eq!(
        refused_status(&format!("ws://{addr}/ws/pet/{pet_id}?token=not-a-jwt")).await,
        401
    );
    assert_eq!(
        refused_status(&format!("ws://{addr}/ws/pet/{pet_id}?token={stranger}")).await,
        403
    );
    assert_eq!(
        refused_status(&format!("ws://{addr}/ws/pet/9999?token={stranger}")).await,
        404
    );
}

#[tokio::test]
async fn test_ws_streams_stats_and_applies_actions() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;
    let addr = t.serve().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/pet/{pet_id}?token={token}"))
        .await
        .unwrap();

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "stats");
    assert_eq!(first["pet_id"], pet_id);
    assert_eq!(first["hunger"], 80);
    assert_eq!(first["alive"], true);

    send_json(&mut ws, json!({ "type": "action", "action": "play" })).await;
    let update = next_json(&mut ws).await;
    assert_eq!(update["type"], "stats");
    assert_eq!(update["happiness"], 100);
    assert_eq!(update["energy"], 70);

    send_json(&mut ws, json!({ "type": "action", "action": "dance" })).await;
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "validation_error");

    send_json(&mut ws, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut ws).await["type"], "pong");

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_ws_one_session_per_pet() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;
    let addr = t.serve().await;
    let url = format!("ws://{addr}/ws/pet/{pet_id}?token={token}");

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_json(&mut first).await["type"], "stats");

    assert_eq!(refused_status(&url).await, 409);
    let (status, _) = t
        .request(
            "POST",
            &format!("/api/pet/{pet_id}/action"),
            Some(&token),
            Some(json!({ "action": "feed" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    first.close(None).await.unwrap();

    // The slot is released once the session has shut down
    let mut reopened = None;
    for _ in 0..100 {
        if let Ok((ws, _)) = connect_async(url.as_str()).await {
            reopened = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut second = reopened.expect("session slot was never released");
    assert_eq!(next_json(&mut second).await["type"], "stats");
}

#[tokio::test]
async fn test_ws_restart_is_owner_only() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;
    let (helper_user, helper) = t.user("bob").await;
    t.db.add_caretaker(pet_id, helper_user.id).await.unwrap();
    t.request("POST", &format!("/api/pet/{pet_id}/sync"), Some(&token), Some(dead_snapshot()))
        .await;
    let addr = t.serve().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/pet/{pet_id}?token={helper}"))
        .await
        .unwrap();
    let first = next_json(&mut ws).await;
    assert_eq!(first["alive"], false);
    assert_eq!(first["mood"], "dead");

    send_json(&mut ws, json!({ "type": "restart" })).await;
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "forbidden");
    ws.close(None).await.unwrap();

    let url = format!("ws://{addr}/ws/pet/{pet_id}?token={token}");
    let mut owner_ws = None;
    for _ in 0..100 {
        if let Ok((ws, _)) = connect_async(url.as_str()).await {
            owner_ws = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut ws = owner_ws.expect("session slot was never released");
    assert_eq!(next_json(&mut ws).await["alive"], false);

    send_json(&mut ws, json!({ "type": "restart" })).await;
    let reborn = next_json(&mut ws).await;
    assert_eq!(reborn["type"], "stats");
    assert_eq!(reborn["alive"], true);
    assert_eq!(reborn["hunger"], 80);
    ws.close(None).await.unwrap();

    let stored = t.db.get_pet(pet_id).await.unwrap().unwrap();
    assert_eq!(stored.generation, 2);
}
