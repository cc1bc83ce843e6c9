//! WebSocket connection driver for one room.
//!
//! A background task owns the socket. It performs the join/peer handshake,
//! requests every known document, then multiplexes document sync and
//! awareness until the connection drops. Dropped connections are retried
//! with exponential backoff; each new connection re-requests full state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::error::SyncError;
use super::protocol::{generate_peer_id, PeerMetadata, ProtocolMessage, PROTOCOL_VERSION};
use crate::awareness::{Awareness, RENEW_INTERVAL};
use crate::document_id::DocumentId;
use crate::element::{ElementId, RoomId};
use crate::room::{Command, Shared};
use crate::store::OutgoingSync;

/// Timeout for connecting and handshake completion.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How often remote awareness entries are checked for expiry.
const EXPIRE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Transport state of a room's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            factor: 2,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let multiplier = self.config.factor.saturating_pow(self.attempt);
        let base = self.config.initial.saturating_mul(multiplier).min(self.config.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter > 0.0 {
            let extra = rand::rng().random_range(0.0..=self.config.jitter);
            base.mul_f64(1.0 + extra)
        } else {
            base
        }
    }
}

/// Connection settings for rooms.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://`, `wss://`, `http://`, `https://` or a bare `host:port`.
    pub server_url: String,
    pub handshake_timeout: Duration,
    pub backoff: BackoffConfig,
    pub metadata: PeerMetadata,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            backoff: BackoffConfig::default(),
            metadata: PeerMetadata::default(),
        }
    }

    /// WebSocket URL of the sync endpoint.
    pub fn sync_url(&self) -> Result<String, SyncError> {
        let (secure, host) = self.split_server_url()?;
        Ok(format!("{}://{}/sync", if secure { "wss" } else { "ws" }, host))
    }

    /// HTTP URL of the health endpoint.
    pub fn health_url(&self) -> Result<String, SyncError> {
        let (secure, host) = self.split_server_url()?;
        Ok(format!("{}://{}/health", if secure { "https" } else { "http" }, host))
    }

    fn split_server_url(&self) -> Result<(bool, String), SyncError> {
        let invalid = |reason| SyncError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason,
        };

        let trimmed = self.server_url.trim();
        if trimmed.is_empty() {
            return Err(invalid("url is empty"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(invalid("url contains whitespace"));
        }

        let (secure, rest) = if let Some(rest) = trimmed.strip_prefix("wss://") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("ws://") {
            (false, rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (false, rest)
        } else if trimmed.contains("://") {
            return Err(invalid("unsupported scheme"));
        } else {
            (false, trimmed)
        };

        let rest = rest.trim_end_matches('/');
        let rest = rest.strip_suffix("/sync").unwrap_or(rest);
        if rest.is_empty() {
            return Err(invalid("url has no host"));
        }
        Ok((secure, rest.to_string()))
    }
}

/// Response of the server's health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

/// Checks the server's health endpoint.
pub async fn check_server(config: &ClientConfig) -> Result<HealthStatus, SyncError> {
    let url = config.health_url()?;
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(config.handshake_timeout)
        .send()
        .await
        .map_err(|e| SyncError::HttpError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(SyncError::HttpError(format!(
            "Server returned status {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| SyncError::HttpError(e.to_string()))
}

enum SessionEnd {
    /// Every handle to the room is gone.
    Shutdown,
    /// The server closed the socket.
    Closed,
}

/// Drives a room's connection until the room is dropped.
pub(crate) async fn run(
    shared: Arc<Shared>,
    config: ClientConfig,
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut backoff = Backoff::new(config.backoff);

    loop {
        let peer_id = generate_peer_id();
        {
            let mut state = shared.lock();
            let changes = state.awareness.set_local_peer(peer_id.clone());
            state.notify_awareness(&changes);
        }
        shared.connection.send_replace(ConnectionState::Connecting);
        tracing::debug!("Connecting to {} for room {}", url, shared.room);

        let connected = timeout(config.handshake_timeout, connect_async(url.as_str())).await;
        match connected {
            Ok(Ok((ws_stream, _))) => {
                let (mut sender, mut receiver) = ws_stream.split();
                let outcome = match perform_handshake(
                    &mut sender,
                    &mut receiver,
                    &shared.room,
                    &peer_id,
                    &config,
                )
                .await
                {
                    Ok(server_id) => {
                        backoff.reset();
                        shared.connection.send_replace(ConnectionState::Connected);
                        tracing::info!("Connected to {} for room {}", url, shared.room);
                        session(
                            &shared,
                            &mut sender,
                            &mut receiver,
                            &mut commands,
                            &peer_id,
                            &server_id,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(SessionEnd::Shutdown) => {
                        let leave = ProtocolMessage::Leave {
                            sender_id: peer_id.clone(),
                        };
                        let _ = send_all(&mut sender, Some(leave)).await;
                        let _ = sender.send(Message::Close(None)).await;
                        shared.connection.send_replace(ConnectionState::Disconnected);
                        tracing::debug!("Room {} closed", shared.room);
                        return;
                    }
                    Ok(SessionEnd::Closed) => {
                        tracing::info!("Server closed connection for room {}", shared.room)
                    }
                    Err(e) => tracing::warn!("Connection for room {} dropped: {}", shared.room, e),
                }
            }
            Ok(Err(e)) => tracing::warn!("Failed to connect to {}: {}", url, e),
            Err(_) => tracing::warn!("Timed out connecting to {}", url),
        }

        {
            let mut state = shared.lock();
            let changes = state.awareness.clear_remote();
            state.notify_awareness(&changes);
        }
        shared.connection.send_replace(ConnectionState::Disconnected);

        let delay = backoff.next_delay();
        tracing::debug!("Reconnecting room {} in {:?}", shared.room, delay);
        if !wait_or_shutdown(delay, &mut commands).await {
            return;
        }
    }
}

/// Sleeps for `delay`. Returns false if the room was dropped meanwhile.
///
/// Commands received while disconnected are discarded; their effects are
/// already in the store and go out with the next connection's requests.
async fn wait_or_shutdown(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => {
                if command.is_none() {
                    return false;
                }
            }
        }
    }
}

/// Performs the handshake with the server.
///
/// Sends a `join` message and waits for a `peer` response.
async fn perform_handshake<S, R>(
    sender: &mut S,
    receiver: &mut R,
    room: &RoomId,
    peer_id: &str,
    config: &ClientConfig,
) -> Result<String, SyncError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let join_msg = ProtocolMessage::Join {
        sender_id: peer_id.to_string(),
        room: room.to_string(),
        supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
        metadata: Some(config.metadata.clone()),
    };
    send_all(sender, Some(join_msg)).await?;

    let peer_response = timeout(config.handshake_timeout, async {
        while let Some(msg_result) = receiver.next().await {
            match msg_result {
                Ok(Message::Binary(data)) => {
                    let msg = ProtocolMessage::decode(&data)
                        .map_err(|e| SyncError::CborError(e.to_string()))?;

                    match msg {
                        ProtocolMessage::Peer {
                            sender_id,
                            target_id,
                            selected_protocol_version,
                        } => {
                            if target_id != peer_id {
                                return Err(SyncError::HandshakeError(
                                    "Peer response target_id mismatch".to_string(),
                                ));
                            }
                            if selected_protocol_version != PROTOCOL_VERSION {
                                return Err(SyncError::HandshakeError(format!(
                                    "Unsupported protocol version {}",
                                    selected_protocol_version
                                )));
                            }
                            return Ok(sender_id);
                        }
                        ProtocolMessage::Error { message } => {
                            return Err(SyncError::HandshakeError(message));
                        }
                        _ => {
                            return Err(SyncError::HandshakeError(format!(
                                "Unexpected message during handshake: {:?}",
                                msg
                            )));
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    return Err(SyncError::HandshakeError(
                        "Server closed connection during handshake".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SyncError::WebSocketError(e.to_string()));
                }
            }
        }
        Err(SyncError::HandshakeError(
            "Connection closed before handshake completed".to_string(),
        ))
    })
    .await;

    match peer_response {
        Ok(result) => result,
        Err(_) => Err(SyncError::HandshakeTimeout),
    }
}

/// Runs an established connection until it ends.
async fn session<S, R>(
    shared: &Shared,
    sender: &mut S,
    receiver: &mut R,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    peer_id: &str,
    server_id: &str,
) -> Result<SessionEnd, SyncError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let opening = begin_session(shared, peer_id, server_id);
    send_all(sender, opening).await?;

    let mut renew = tokio::time::interval_at(
        tokio::time::Instant::now() + RENEW_INTERVAL,
        RENEW_INTERVAL,
    );
    let mut expire = tokio::time::interval(EXPIRE_CHECK_INTERVAL);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    return Ok(SessionEnd::Shutdown);
                };
                let outgoing = handle_command(shared, command, peer_id, server_id);
                send_all(sender, outgoing).await?;
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let replies = handle_message(shared, &data, peer_id, server_id);
                    send_all(sender, replies).await?;
                }
                Some(Ok(Message::Ping(data))) => {
                    sender
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SyncError::WebSocketError(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SyncError::WebSocketError(e.to_string())),
            },
            _ = renew.tick() => {
                let update = {
                    let mut state = shared.lock();
                    awareness_message(&mut state.awareness)
                };
                send_all(sender, Some(update)).await?;
            }
            _ = expire.tick() => {
                let mut state = shared.lock();
                let changes = state.awareness.expire(Instant::now());
                state.notify_awareness(&changes);
            }
        }
    }
}

/// Requests every known document and announces local awareness.
fn begin_session(shared: &Shared, peer_id: &str, server_id: &str) -> Vec<ProtocolMessage> {
    let (messages, nothing_to_wait_for) = {
        let mut guard = shared.lock();
        let state = &mut *guard;
        state.store.reset_sync();

        let elements: Vec<ElementId> = state.store.elements().cloned().collect();
        let waiting = !*shared.synced.borrow();
        state.initial = waiting.then(|| elements.iter().cloned().collect());

        let mut messages: Vec<ProtocolMessage> = elements
            .iter()
            .filter_map(|element| state.store.generate_sync_message(element))
            .map(|outgoing| document_message(outgoing, peer_id, server_id))
            .collect();
        messages.push(awareness_message(&mut state.awareness));

        (messages, waiting && elements.is_empty())
    };

    if nothing_to_wait_for {
        shared.mark_synced();
    }
    messages
}

fn handle_command(
    shared: &Shared,
    command: Command,
    peer_id: &str,
    server_id: &str,
) -> Option<ProtocolMessage> {
    let mut state = shared.lock();
    match command {
        Command::Document(element) => state
            .store
            .generate_sync_message(&element)
            .map(|outgoing| document_message(outgoing, peer_id, server_id)),
        Command::Awareness => Some(awareness_message(&mut state.awareness)),
    }
}

/// Applies one server message and returns the replies it calls for.
fn handle_message(
    shared: &Shared,
    data: &[u8],
    peer_id: &str,
    server_id: &str,
) -> Vec<ProtocolMessage> {
    let msg = match ProtocolMessage::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Dropping undecodable message: {}", e);
            return Vec::new();
        }
    };

    match msg {
        ProtocolMessage::Sync {
            document_id, data, ..
        }
        | ProtocolMessage::Request {
            document_id, data, ..
        } => {
            let Ok(parsed) = document_id.parse::<DocumentId>() else {
                tracing::warn!("Dropping sync for malformed document id {}", document_id);
                return Vec::new();
            };

            let (reply, completed) = {
                let mut guard = shared.lock();
                let state = &mut *guard;
                let received = match state.store.receive_sync_message(&parsed, &data) {
                    Ok(Some(received)) => received,
                    Ok(None) => {
                        tracing::debug!("Ignoring sync for unbound document {}", document_id);
                        return Vec::new();
                    }
                    Err(e) => {
                        tracing::warn!("Failed to apply sync for document {}: {}", document_id, e);
                        return Vec::new();
                    }
                };

                if received.changed || received.first_sync || received.flushed {
                    state.notify(received.element.as_str());
                }

                let completed = match state.initial.as_mut() {
                    Some(initial) if state.store.is_synced(&received.element) => {
                        initial.remove(&received.element);
                        initial.is_empty()
                    }
                    _ => false,
                };
                if completed {
                    state.initial = None;
                }

                let reply = state
                    .store
                    .generate_sync_message(&received.element)
                    .map(|outgoing| document_message(outgoing, peer_id, server_id));
                (reply, completed)
            };

            if completed {
                shared.mark_synced();
            }
            reply.into_iter().collect()
        }
        ProtocolMessage::Awareness {
            sender_id,
            clock,
            state,
        } => {
            let mut guard = shared.lock();
            if let Some(change) = guard
                .awareness
                .apply_remote(&sender_id, clock, state, Instant::now())
            {
                if change.removed {
                    tracing::debug!("Peer {} left room {}", change.peer, shared.room);
                }
                guard.notify_awareness(&[change]);
            }
            Vec::new()
        }
        ProtocolMessage::Error { message } => {
            tracing::warn!("Server reported error: {}", message);
            Vec::new()
        }
        other => {
            tracing::debug!("Ignoring unexpected message: {:?}", other);
            Vec::new()
        }
    }
}

fn document_message(outgoing: OutgoingSync, peer_id: &str, server_id: &str) -> ProtocolMessage {
    let document_id = outgoing.document_id.to_string();
    if outgoing.request {
        ProtocolMessage::Request {
            document_id,
            sender_id: peer_id.to_string(),
            target_id: server_id.to_string(),
            data: outgoing.data,
        }
    } else {
        ProtocolMessage::Sync {
            document_id,
            sender_id: peer_id.to_string(),
            target_id: server_id.to_string(),
            data: outgoing.data,
        }
    }
}

fn awareness_message(awareness: &mut Awareness) -> ProtocolMessage {
    let update = awareness.renew();
    ProtocolMessage::Awareness {
        sender_id: awareness.local_peer().to_string(),
        clock: update.clock,
        state: Some(update.state),
    }
}

async fn send_all<S>(
    sender: &mut S,
    messages: impl IntoIterator<Item = ProtocolMessage>,
) -> Result<(), SyncError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    for message in messages {
        let encoded = message
            .encode()
            .map_err(|e| SyncError::CborError(e.to_string()))?;
        sender
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|e| SyncError::WebSocketError(e.to_string()))?;
    }
    Ok(())
}
