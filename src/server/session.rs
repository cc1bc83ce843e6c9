//! Per-connection sync state.

use automerge::sync;
use sharedstate_core::sync::ProtocolMessage;
use sharedstate_core::DocumentId;
use std::collections::HashMap;
use std::sync::Arc;

use super::hub::{RoomChannel, RoomEvent, SessionError};

/// Manages sync operations for one connected client.
///
/// Keeps an automerge sync state per document the client has requested.
pub struct ClientSession {
    channel: Arc<RoomChannel>,
    peer_id: String,
    server_id: String,
    states: HashMap<DocumentId, sync::State>,
}

impl ClientSession {
    pub fn new(channel: Arc<RoomChannel>, peer_id: String, server_id: String) -> Self {
        Self {
            channel,
            peer_id,
            server_id,
            states: HashMap::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn channel(&self) -> &Arc<RoomChannel> {
        &self.channel
    }

    /// Handles one client message and returns the replies.
    pub async fn handle(&mut self, msg: ProtocolMessage) -> Vec<ProtocolMessage> {
        match msg {
            ProtocolMessage::Request {
                document_id, data, ..
            } => {
                if let Ok(id) = document_id.parse::<DocumentId>() {
                    self.states.insert(id, sync::State::new());
                }
                self.reply(&document_id, &data).await
            }
            ProtocolMessage::Sync {
                document_id, data, ..
            } => self.reply(&document_id, &data).await,
            ProtocolMessage::Awareness {
                sender_id,
                clock,
                state,
            } => {
                if sender_id != self.peer_id {
                    tracing::warn!(
                        "Dropping awareness for {} sent by {}",
                        sender_id,
                        self.peer_id
                    );
                    return Vec::new();
                }
                self.channel.update_awareness(&sender_id, clock, state).await;
                Vec::new()
            }
            other => {
                tracing::debug!("Ignoring unexpected message from {}: {:?}", self.peer_id, other);
                Vec::new()
            }
        }
    }

    async fn reply(&mut self, document_id: &str, data: &[u8]) -> Vec<ProtocolMessage> {
        match self.sync(document_id, data).await {
            Ok(reply) => reply.into_iter().collect(),
            Err(e) => {
                tracing::warn!("Sync failed for {} on {}: {}", self.peer_id, document_id, e);
                vec![ProtocolMessage::Error {
                    message: e.to_string(),
                }]
            }
        }
    }

    async fn sync(
        &mut self,
        document_id: &str,
        data: &[u8],
    ) -> Result<Option<ProtocolMessage>, SessionError> {
        let id: DocumentId = document_id
            .parse()
            .map_err(|_| SessionError::InvalidDocumentId(document_id.to_string()))?;
        let state = self.states.entry(id).or_insert_with(sync::State::new);

        let reply = self
            .channel
            .sync_document(&id, state, Some(data), &self.peer_id)
            .await?;
        Ok(reply.map(|data| self.sync_message(&id, data)))
    }

    /// Turns a room event into messages for this client.
    pub async fn handle_event(&mut self, event: RoomEvent) -> Vec<ProtocolMessage> {
        match event {
            RoomEvent::DocumentChanged {
                document_id,
                origin,
            } => {
                if origin == self.peer_id {
                    return Vec::new();
                }
                self.push(&document_id).await.into_iter().collect()
            }
            RoomEvent::Awareness {
                sender_id,
                clock,
                state,
            } => {
                if sender_id == self.peer_id {
                    return Vec::new();
                }
                vec![ProtocolMessage::Awareness {
                    sender_id,
                    clock,
                    state,
                }]
            }
        }
    }

    /// Re-offers every tracked document and the full awareness table.
    ///
    /// Used after this connection fell behind the room's event stream.
    pub async fn resync(&mut self) -> Vec<ProtocolMessage> {
        let ids: Vec<DocumentId> = self.states.keys().copied().collect();
        let mut messages = Vec::new();
        for id in ids {
            messages.extend(self.push(&id).await);
        }
        messages.extend(self.channel.awareness_snapshot(&self.peer_id).await);
        messages
    }

    /// Sends changes the client has not seen yet for a tracked document.
    async fn push(&mut self, document_id: &DocumentId) -> Option<ProtocolMessage> {
        // Documents the client never requested are not bound there.
        let state = self.states.get_mut(document_id)?;
        match self
            .channel
            .sync_document(document_id, state, None, &self.peer_id)
            .await
        {
            Ok(reply) => reply.map(|data| self.sync_message(document_id, data)),
            Err(e) => {
                tracing::warn!("Failed to push {} to {}: {}", document_id, self.peer_id, e);
                None
            }
        }
    }

    fn sync_message(&self, document_id: &DocumentId, data: Vec<u8>) -> ProtocolMessage {
        ProtocolMessage::Sync {
            document_id: document_id.to_string(),
            sender_id: self.server_id.clone(),
            target_id: self.peer_id.clone(),
            data,
        }
    }

    /// Drops this connection's awareness from the room.
    pub async fn close(self) {
        self.channel.remove_awareness(&self.peer_id).await;
        tracing::debug!("Session {} left room {}", self.peer_id, self.channel.room());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RoomHub, ServerStorage};
    use automerge::sync::SyncDoc;
    use automerge::transaction::Transactable;
    use automerge::{AutoCommit, ReadDoc, ROOT};
    use sharedstate_core::{ElementId, PlayerIdentity, PresenceState, RoomId};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        hub: RoomHub,
        room: RoomId,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let hub = RoomHub::new(ServerStorage::new(temp.path()));
            Self {
                _temp: temp,
                hub,
                room: RoomId::parse("/test").unwrap(),
            }
        }

        async fn session(&self, peer: &str) -> ClientSession {
            let channel = self.hub.join(&self.room).await;
            ClientSession::new(channel, peer.to_string(), "server".to_string())
        }

        fn doc_id(&self, element: &str) -> DocumentId {
            DocumentId::for_element(&self.room, &ElementId::parse(element).unwrap())
        }
    }

    /// A stand-in client document with its own sync state.
    struct Peer {
        doc: AutoCommit,
        state: sync::State,
        requested: bool,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                doc: AutoCommit::new(),
                state: sync::State::new(),
                requested: false,
            }
        }

        fn outgoing(&mut self, id: &DocumentId) -> Option<ProtocolMessage> {
            let data = self.doc.sync().generate_sync_message(&mut self.state)?.encode();
            let document_id = id.to_string();
            let msg = if self.requested {
                ProtocolMessage::Sync {
                    document_id,
                    sender_id: "client".to_string(),
                    target_id: "server".to_string(),
                    data,
                }
            } else {
                self.requested = true;
                ProtocolMessage::Request {
                    document_id,
                    sender_id: "client".to_string(),
                    target_id: "server".to_string(),
                    data,
                }
            };
            Some(msg)
        }

        fn receive(&mut self, messages: Vec<ProtocolMessage>) {
            for msg in messages {
                if let ProtocolMessage::Sync { data, .. } = msg {
                    let decoded = sync::Message::decode(&data).unwrap();
                    self.doc
                        .sync()
                        .receive_sync_message(&mut self.state, decoded)
                        .unwrap();
                }
            }
        }

        async fn settle(&mut self, session: &mut ClientSession, id: &DocumentId) {
            for _ in 0..16 {
                let Some(msg) = self.outgoing(id) else {
                    return;
                };
                let replies = session.handle(msg).await;
                self.receive(replies);
            }
            panic!("sync did not settle");
        }

        fn value(&self) -> Option<String> {
            self.doc
                .get(ROOT, "value")
                .unwrap()
                .map(|(v, _)| v.into_string().unwrap())
        }
    }

    #[tokio::test]
    async fn test_changes_from_one_session_reach_another() {
        let fixture = Fixture::new();
        let id = fixture.doc_id("title");

        let mut session_a = fixture.session("a").await;
        let mut session_b = fixture.session("b").await;
        let mut events_b = session_b.channel().subscribe();

        let mut reader = Peer::new();
        reader.settle(&mut session_b, &id).await;
        assert_eq!(reader.value(), None);

        let mut writer = Peer::new();
        writer.doc.put(ROOT, "value", "hello").unwrap();
        writer.settle(&mut session_a, &id).await;

        let mut pushed = Vec::new();
        while let Ok(event) = events_b.try_recv() {
            pushed.extend(session_b.handle_event(event).await);
        }
        assert!(!pushed.is_empty());
        reader.receive(pushed);
        reader.settle(&mut session_b, &id).await;
        assert_eq!(reader.value(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_own_changes_are_not_echoed() {
        let fixture = Fixture::new();
        let id = fixture.doc_id("title");
        let mut session = fixture.session("a").await;
        let mut events = session.channel().subscribe();

        let mut writer = Peer::new();
        writer.doc.put(ROOT, "value", "mine").unwrap();
        writer.settle(&mut session, &id).await;

        while let Ok(event) = events.try_recv() {
            assert!(session.handle_event(event).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_untracked_documents_are_not_pushed() {
        let fixture = Fixture::new();
        let id = fixture.doc_id("title");
        let mut session = fixture.session("a").await;

        let replies = session
            .handle_event(RoomEvent::DocumentChanged {
                document_id: id,
                origin: "b".to_string(),
            })
            .await;
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_document_id_returns_error() {
        let fixture = Fixture::new();
        let mut session = fixture.session("a").await;
        let replies = session
            .handle(ProtocolMessage::Sync {
                document_id: "../etc/passwd".to_string(),
                sender_id: "a".to_string(),
                target_id: "server".to_string(),
                data: vec![],
            })
            .await;
        assert!(matches!(&replies[..], [ProtocolMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn test_awareness_is_relayed_and_removed_on_close() {
        let fixture = Fixture::new();
        let mut session_a = fixture.session("a").await;
        let mut session_b = fixture.session("b").await;
        let mut events = session_b.channel().subscribe();

        let update = ProtocolMessage::Awareness {
            sender_id: "a".to_string(),
            clock: 1,
            state: Some(PresenceState::new(PlayerIdentity::generate())),
        };
        assert!(session_a.handle(update).await.is_empty());

        let relayed = session_b.handle_event(events.try_recv().unwrap()).await;
        assert!(matches!(
            &relayed[..],
            [ProtocolMessage::Awareness { sender_id, state: Some(_), .. }] if sender_id == "a"
        ));

        session_a.close().await;
        let removal = session_b.handle_event(events.try_recv().unwrap()).await;
        assert!(matches!(
            &removal[..],
            [ProtocolMessage::Awareness { sender_id, state: None, .. }] if sender_id == "a"
        ));
        assert!(session_b.resync().await.is_empty());
    }

    #[tokio::test]
    async fn test_spoofed_awareness_is_dropped() {
        let fixture = Fixture::new();
        let mut session = fixture.session("a").await;
        let spoof = ProtocolMessage::Awareness {
            sender_id: "b".to_string(),
            clock: 1,
            state: Some(PresenceState::new(PlayerIdentity::generate())),
        };
        session.handle(spoof).await;
        assert!(session.channel().awareness_snapshot("a").await.is_empty());
    }
}
