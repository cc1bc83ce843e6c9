//! HTTP endpoints: health check and the room sync WebSocket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use sharedstate_core::sync::{generate_peer_id, ProtocolMessage, PROTOCOL_VERSION};
use sharedstate_core::RoomId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;

use super::hub::RoomHub;
use super::session::ClientSession;

/// How long a new socket may take to send its `join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    hub: Arc<RoomHub>,
    server_id: String,
}

impl AppState {
    pub fn new(hub: Arc<RoomHub>) -> Self {
        Self {
            hub,
            server_id: generate_peer_id(),
        }
    }
}

/// Builds the server's router.
pub fn router(hub: Arc<RoomHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", get(sync_socket))
        .with_state(AppState::new(hub))
        .layer(TraceLayer::new_for_http())
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn sync_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (room, peer_id) = match wait_for_join(&mut receiver).await {
        Ok(joined) => joined,
        Err(message) => {
            tracing::warn!("Rejecting connection: {}", message);
            let _ = send(&mut sender, ProtocolMessage::Error { message }).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let channel = state.hub.join(&room).await;
    let mut events = channel.subscribe();
    let snapshot = channel.awareness_snapshot(&peer_id).await;
    let mut session = ClientSession::new(channel, peer_id.clone(), state.server_id.clone());

    let peer = ProtocolMessage::Peer {
        sender_id: state.server_id.clone(),
        target_id: peer_id.clone(),
        selected_protocol_version: PROTOCOL_VERSION.to_string(),
    };
    if send_all(&mut sender, std::iter::once(peer).chain(snapshot))
        .await
        .is_err()
    {
        session.close().await;
        return;
    }
    tracing::info!(
        "Peer {} joined room {} ({} rooms open)",
        peer_id,
        room,
        state.hub.room_count().await
    );

    loop {
        tokio::select! {
            message = receiver.next() => {
                let data = match message {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for {}: {}", peer_id, e);
                        break;
                    }
                };
                let msg = match ProtocolMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable message from {}: {}", peer_id, e);
                        continue;
                    }
                };
                if matches!(msg, ProtocolMessage::Leave { .. }) {
                    break;
                }
                let replies = session.handle(msg).await;
                if send_all(&mut sender, replies).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                let outgoing = match event {
                    Ok(event) => session.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Peer {} lagged by {} events, resyncing", peer_id, skipped);
                        session.resync().await
                    }
                    Err(RecvError::Closed) => break,
                };
                if send_all(&mut sender, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
    tracing::info!("Peer {} left room {}", peer_id, room);
}

/// Waits for the opening `join` and validates it.
async fn wait_for_join<R>(receiver: &mut R) -> Result<(RoomId, String), String>
where
    R: StreamExt<Item = Result<Message, axum::Error>> + Unpin,
{
    let first = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(data),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("Connection closed before join".to_string())
    })
    .await
    .map_err(|_| "Timed out waiting for join".to_string())??;

    match ProtocolMessage::decode(&first).map_err(|e| format!("Undecodable join: {}", e))? {
        ProtocolMessage::Join {
            sender_id,
            room,
            supported_protocol_versions,
            ..
        } => {
            if !supported_protocol_versions
                .iter()
                .any(|version| version == PROTOCOL_VERSION)
            {
                return Err(format!(
                    "Unsupported protocol versions {:?}",
                    supported_protocol_versions
                ));
            }
            if sender_id.is_empty() {
                return Err("Join without sender id".to_string());
            }
            let room = RoomId::parse(room).map_err(|e| format!("Invalid room: {}", e))?;
            Ok((room, sender_id))
        }
        other => Err(format!("Expected join, got {:?}", other)),
    }
}

async fn send<S>(sender: &mut S, message: ProtocolMessage) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let encoded = message.encode().map_err(|e| e.to_string())?;
    sender
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn send_all<S>(
    sender: &mut S,
    messages: impl IntoIterator<Item = ProtocolMessage>,
) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    for message in messages {
        send(sender, message).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg: ProtocolMessage) -> Result<Message, axum::Error> {
        Ok(Message::Binary(msg.encode().unwrap().into()))
    }

    fn join(room: &str, versions: &[&str]) -> ProtocolMessage {
        ProtocolMessage::Join {
            sender_id: "peer".to_string(),
            room: room.to_string(),
            supported_protocol_versions: versions.iter().map(|v| v.to_string()).collect(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_join_is_accepted() {
        let mut receiver = futures::stream::iter(vec![frame(join("/blog", &["1"]))]);
        let (room, peer) = wait_for_join(&mut receiver).await.unwrap();
        assert_eq!(room.as_str(), "/blog");
        assert_eq!(peer, "peer");
    }

    #[tokio::test]
    async fn test_join_rejects_bad_room_and_version() {
        let mut receiver = futures::stream::iter(vec![frame(join("has space", &["1"]))]);
        let err = wait_for_join(&mut receiver).await.unwrap_err();
        assert!(err.starts_with("Invalid room"));

        let mut receiver = futures::stream::iter(vec![frame(join("/blog", &["0"]))]);
        let err = wait_for_join(&mut receiver).await.unwrap_err();
        assert!(err.starts_with("Unsupported protocol versions"));
    }

    #[tokio::test]
    async fn test_first_message_must_be_join() {
        let leave = ProtocolMessage::Leave {
            sender_id: "peer".to_string(),
        };
        let mut receiver = futures::stream::iter(vec![frame(leave)]);
        let err = wait_for_join(&mut receiver).await.unwrap_err();
        assert!(err.starts_with("Expected join"));

        let mut receiver = futures::stream::iter(Vec::<Result<Message, axum::Error>>::new());
        let err = wait_for_join(&mut receiver).await.unwrap_err();
        assert_eq!(err, "Connection closed before join");
    }
}
