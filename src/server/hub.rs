//! Room registry and per-room shared state.
//!
//! Every room has one [`RoomChannel`]: the room's documents (loaded lazily
//! from storage), the latest awareness state of each connection, and a
//! broadcast channel that tells the other connections what changed.

use automerge::sync::{self, SyncDoc};
use automerge::AutoCommit;
use sharedstate_core::sync::ProtocolMessage;
use sharedstate_core::{DocumentId, PresenceState, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::storage::{ServerStorage, ServerStorageError};

/// Events fanned out to every connection in a room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A connection merged new changes into a document.
    DocumentChanged {
        document_id: DocumentId,
        origin: String,
    },
    /// A connection's awareness state changed or was removed.
    Awareness {
        sender_id: String,
        clock: u64,
        state: Option<PresenceState>,
    },
}

/// Errors that can occur while syncing a document.
#[derive(Debug)]
pub enum SessionError {
    /// Error decoding a sync message.
    DecodeError(String),
    /// Error during sync protocol.
    SyncError(String),
    /// Storage error.
    StorageError(ServerStorageError),
    /// Document id that is not bs58check.
    InvalidDocumentId(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::DecodeError(e) => write!(f, "Failed to decode sync message: {}", e),
            SessionError::SyncError(e) => write!(f, "Sync error: {}", e),
            SessionError::StorageError(e) => write!(f, "Storage error: {}", e),
            SessionError::InvalidDocumentId(id) => write!(f, "Invalid document ID: {}", id),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ServerStorageError> for SessionError {
    fn from(e: ServerStorageError) -> Self {
        SessionError::StorageError(e)
    }
}

/// Buffered events per room before slow connections start lagging.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct AwarenessRecord {
    clock: u64,
    state: PresenceState,
}

/// Shared state of one room.
pub struct RoomChannel {
    room: RoomId,
    storage: ServerStorage,
    documents: Mutex<HashMap<DocumentId, AutoCommit>>,
    awareness: Mutex<HashMap<String, AwarenessRecord>>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomChannel {
    fn new(room: RoomId, storage: ServerStorage) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            room,
            storage,
            documents: Mutex::new(HashMap::new()),
            awareness: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Subscribes to this room's events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    fn broadcast(&self, event: RoomEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.events.send(event);
    }

    /// Performs a sync round for one document on behalf of a connection.
    ///
    /// Applies `message` if given, persists and broadcasts when the
    /// document's heads moved, and returns the next message for the
    /// connection, if any.
    pub async fn sync_document(
        &self,
        document_id: &DocumentId,
        state: &mut sync::State,
        message: Option<&[u8]>,
        origin: &str,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let mut documents = self.documents.lock().await;

        let doc = match documents.entry(*document_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let loaded = self
                    .storage
                    .load(&self.room, document_id)?
                    .unwrap_or_else(AutoCommit::new);
                entry.insert(loaded)
            }
        };

        if let Some(bytes) = message {
            let msg =
                sync::Message::decode(bytes).map_err(|e| SessionError::DecodeError(e.to_string()))?;

            let before = doc.get_heads();
            doc.sync()
                .receive_sync_message(state, msg)
                .map_err(|e| SessionError::SyncError(e.to_string()))?;

            if doc.get_heads() != before {
                self.storage.save(&self.room, document_id, doc)?;
                tracing::debug!(
                    "Applied sync from {} for {}/{}, doc now has {} heads",
                    origin,
                    self.room,
                    document_id,
                    doc.get_heads().len()
                );
                self.broadcast(RoomEvent::DocumentChanged {
                    document_id: *document_id,
                    origin: origin.to_string(),
                });
            }
        }

        let reply = doc.sync().generate_sync_message(state).map(|msg| msg.encode());
        Ok(reply)
    }

    /// Records a connection's awareness update and fans it out.
    ///
    /// Stale clocks are dropped. Returns whether the update was applied.
    pub async fn update_awareness(
        &self,
        sender_id: &str,
        clock: u64,
        state: Option<PresenceState>,
    ) -> bool {
        let mut table = self.awareness.lock().await;
        let stored = table.get(sender_id).map(|record| record.clock);

        match state {
            Some(state) => {
                if stored.is_some_and(|known| clock <= known) {
                    return false;
                }
                table.insert(
                    sender_id.to_string(),
                    AwarenessRecord {
                        clock,
                        state: state.clone(),
                    },
                );
                self.broadcast(RoomEvent::Awareness {
                    sender_id: sender_id.to_string(),
                    clock,
                    state: Some(state),
                });
                true
            }
            None => {
                if stored.is_some_and(|known| clock < known) {
                    return false;
                }
                table.remove(sender_id);
                self.broadcast(RoomEvent::Awareness {
                    sender_id: sender_id.to_string(),
                    clock,
                    state: None,
                });
                true
            }
        }
    }

    /// Removes a disconnected connection's awareness entry and tells the room.
    pub async fn remove_awareness(&self, sender_id: &str) {
        let removed = self.awareness.lock().await.remove(sender_id);
        if let Some(record) = removed {
            self.broadcast(RoomEvent::Awareness {
                sender_id: sender_id.to_string(),
                clock: record.clock,
                state: None,
            });
        }
    }

    /// Current awareness of every connection except `exclude`, as messages.
    pub async fn awareness_snapshot(&self, exclude: &str) -> Vec<ProtocolMessage> {
        let table = self.awareness.lock().await;
        let mut senders: Vec<&String> = table.keys().filter(|id| *id != exclude).collect();
        senders.sort();
        senders
            .into_iter()
            .map(|sender_id| {
                let record = &table[sender_id];
                ProtocolMessage::Awareness {
                    sender_id: sender_id.clone(),
                    clock: record.clock,
                    state: Some(record.state.clone()),
                }
            })
            .collect()
    }
}

/// Tracks every active room.
pub struct RoomHub {
    storage: ServerStorage,
    rooms: RwLock<HashMap<RoomId, Arc<RoomChannel>>>,
}

impl RoomHub {
    pub fn new(storage: ServerStorage) -> Self {
        Self {
            storage,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the channel for a room, creating it on first use.
    pub async fn join(&self, room: &RoomId) -> Arc<RoomChannel> {
        if let Some(channel) = self.rooms.read().await.get(room) {
            return channel.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.clone())
            .or_insert_with(|| {
                tracing::info!("Opening room {}", room);
                Arc::new(RoomChannel::new(room.clone(), self.storage.clone()))
            })
            .clone()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
