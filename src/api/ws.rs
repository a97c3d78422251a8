// WebSocket handler for live pet sessions.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use super::{json_error, AppState};
use crate::auth::{authorize_pet, verify_token, PetAccess};
use crate::pet::actions::Action;
use crate::pet::session::{PetSession, SessionState};
use crate::pet::{require_pet, PetError};

#[derive(Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Messages a client may send on a session socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Action { action: String },
    /// Hatch the next generation of a dead pet (owner only).
    Restart,
    Ping,
}

/// Messages streamed to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Stats(SessionState),
    Error { error: String, message: String },
    Pong,
}

impl ServerMessage {
    fn from_error(err: &PetError) -> Self {
        ServerMessage::Error {
            error: err.code().to_string(),
            message: err.public_message(),
        }
    }
}

/// WebSocket upgrade handler. Browsers cannot set headers on a WebSocket
/// request, so the JWT travels in the `token` query parameter.
pub async fn ws_pet(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(pet_id): Path<i64>,
    Query(params): Query<WsParams>,
) -> Response {
    let Some(claims) = params.token.as_deref().and_then(|t| verify_token(t).ok()) else {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid token");
    };

    if let Err(e) = authorize_pet(&state.db, claims.sub, pet_id, PetAccess::Care).await {
        return e.into_response();
    }

    let Some(slot) = state.sessions.try_acquire(pet_id) else {
        return PetError::Conflict("A live session is already open for this pet".to_string())
            .into_response();
    };

    // Load after claiming so no REST stat write can land in between.
    let pet = match require_pet(&state.db, pet_id).await {
        Ok(pet) => pet,
        Err(e) => return e.into_response(),
    };
    let owner = pet.user_id == claims.sub;

    ws.on_upgrade(move |socket| async move {
        let session = PetSession::start(state.db.clone(), &pet, slot, state.timers);
        handle_ws(socket, &session, owner).await;
        session.shutdown().await;
    })
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode session message: {e}");
            return false;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn handle_client_message(session: &PetSession, owner: bool, text: &str) -> ServerMessage {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::from_error(&PetError::Validation(format!(
                "invalid message: {e}"
            )))
        }
    };

    let result = match msg {
        ClientMessage::Ping => return ServerMessage::Pong,
        ClientMessage::Action { action } => match action.parse::<Action>() {
            Ok(action) => session.act(action).await,
            Err(e) => Err(e),
        },
        ClientMessage::Restart if owner => session.restart().await,
        ClientMessage::Restart => Err(PetError::Forbidden("Only the owner can do that")),
    };

    match result {
        Ok(state) => ServerMessage::Stats(state),
        Err(e) => {
            if let PetError::Database(ref db_err) = e {
                tracing::error!(pet_id = session.pet_id(), "Session message failed: {db_err}");
            }
            ServerMessage::from_error(&e)
        }
    }
}

async fn handle_ws(mut socket: WebSocket, session: &PetSession, owner: bool) {
    let mut rx = session.subscribe();

    // Current state first so the client renders immediately.
    if !send(&mut socket, &ServerMessage::Stats(session.snapshot())).await {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(state) => {
                        if !send(&mut socket, &ServerMessage::Stats(state)).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(pet_id = session.pet_id(), "Session client lagged, skipped {n} updates");
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(session, owner, text.as_str()).await;
                        // Successful actions also arrive via the broadcast channel
                        if matches!(reply, ServerMessage::Stats(_)) {
                            continue;
                        }
                        if !send(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"action","action":"feed"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Action { action } if action == "feed"));
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"restart"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Restart));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_error_message_shape() {
        let msg = ServerMessage::from_error(&PetError::Validation("bad".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "validation_error");
        assert_eq!(json["message"], "bad");
    }
}
