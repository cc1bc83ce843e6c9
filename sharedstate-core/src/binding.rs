//! Element bindings.
//!
//! [`Room::bind`] attaches a typed handle to one element's document and
//! awareness slot. Values cross the boundary through serde: the document
//! holds plain JSON-like data and each handle decodes it into `T`. A merged
//! value that no longer decodes is reported once per read with a warning
//! and the handle keeps serving the last value that did.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::crdt::{Draft, Path};
use crate::element::{ElementId, ElementPath, IdentityError, RoomId};
use crate::player::PlayerIdentity;
use crate::room::{Command, Room};
use crate::store::Update;
use crate::sync::{ClientConfig, SyncError};

#[derive(Error, Debug)]
pub enum BindError {
    #[error("element has neither an id nor a structural path")]
    MissingIdentity,

    #[error("invalid element identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("default data cannot be represented as a document: {0}")]
    InvalidDefault(#[from] serde_json::Error),

    #[error("binding for room {requested} used on room {actual}")]
    RoomMismatch { requested: RoomId, actual: RoomId },

    #[error(transparent)]
    Connect(#[from] SyncError),
}

/// What to bind and how to seed it.
#[derive(Debug, Clone)]
pub struct BindOptions<T, A = Value> {
    pub id: Option<String>,
    pub path: Option<ElementPath>,
    pub default_data: T,
    pub default_awareness: Option<A>,
    pub room: Option<RoomId>,
    /// Integer fields kept as counters, so concurrent increments add up.
    pub counters: Vec<Path>,
}

impl<T, A> BindOptions<T, A> {
    pub fn new(default_data: T) -> Self {
        Self {
            id: None,
            path: None,
            default_data,
            default_awareness: None,
            room: None,
            counters: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn path(mut self, path: ElementPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn awareness(mut self, default_awareness: A) -> Self {
        self.default_awareness = Some(default_awareness);
        self
    }

    pub fn room(mut self, room: RoomId) -> Self {
        self.room = Some(room);
        self
    }

    pub fn counter(mut self, path: impl Into<Path>) -> Self {
        self.counters.push(path.into());
        self
    }

    /// The explicit id wins over the structural path.
    pub fn element(&self) -> Result<ElementId, BindError> {
        match (&self.id, &self.path) {
            (Some(id), _) => Ok(ElementId::parse(id.as_str())?),
            (None, Some(path)) => Ok(ElementId::from_path(path)?),
            (None, None) => Err(BindError::MissingIdentity),
        }
    }
}

/// One connection's awareness payload for a bound element.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAwareness<A> {
    pub peer: String,
    pub is_local: bool,
    pub player: PlayerIdentity,
    pub state: A,
}

impl Room {
    /// Binds an element. Never waits for the network: the handle serves
    /// the default (or whatever is already known) immediately.
    pub fn bind<T, A>(&self, options: BindOptions<T, A>) -> Result<ElementHandle<T, A>, BindError>
    where
        T: Serialize + DeserializeOwned + Clone,
        A: Serialize + DeserializeOwned + Clone,
    {
        if let Some(requested) = &options.room {
            if requested != self.id() {
                return Err(BindError::RoomMismatch {
                    requested: requested.clone(),
                    actual: self.id().clone(),
                });
            }
        }

        let element = options.element()?;
        let default = serde_json::to_value(&options.default_data)?;
        let default_awareness = options
            .default_awareness
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let (current, created, awareness_set, changes) = {
            let mut state = self.shared.lock();
            let (current, created) = state.store.bind(&element, default);
            for path in &options.counters {
                state.store.mark_counter(&element, path.clone());
            }
            let changes = state.subscribe(&element);

            let has_slot = state
                .awareness
                .local_state()
                .elements
                .contains_key(element.as_str());
            let awareness_set = match default_awareness {
                Some(payload) if !has_slot => {
                    state.awareness.set_element(&element, payload);
                    state.notify(element.as_str());
                    true
                }
                _ => false,
            };
            (current, created, awareness_set, changes)
        };

        if created {
            tracing::debug!("Bound element {} in room {}", element, self.id());
            self.send(Command::Document(element.clone()));
        }
        if awareness_set {
            self.send(Command::Awareness);
        }

        let last_good = match serde_json::from_value(current) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Element {} holds a value of unexpected shape, using default: {}",
                    element,
                    e
                );
                options.default_data
            }
        };

        Ok(ElementHandle {
            room: self.clone(),
            element,
            changes,
            last_good: Mutex::new(last_good),
            _awareness: PhantomData,
        })
    }
}

/// A live binding to one element.
///
/// Dropping the handle releases the binding. The document itself stays in
/// the room so pending writes are still delivered.
pub struct ElementHandle<T, A = Value> {
    room: Room,
    element: ElementId,
    changes: watch::Receiver<u64>,
    last_good: Mutex<T>,
    _awareness: PhantomData<fn() -> A>,
}

impl<T, A> ElementHandle<T, A>
where
    T: Serialize + DeserializeOwned + Clone,
    A: Serialize + DeserializeOwned + Clone,
{
    pub fn element(&self) -> &ElementId {
        &self.element
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Current merged value.
    pub fn value(&self) -> T {
        let raw = self.room.shared.lock().store.read(&self.element);
        let mut last_good = self.last_good.lock().unwrap_or_else(|e| e.into_inner());
        match raw.map(serde_json::from_value::<T>) {
            Some(Ok(value)) => {
                *last_good = value.clone();
                value
            }
            Some(Err(e)) => {
                tracing::warn!(
                    "Element {} holds a value of unexpected shape, keeping last good value: {}",
                    self.element,
                    e
                );
                last_good.clone()
            }
            None => last_good.clone(),
        }
    }

    /// Replaces the whole value.
    ///
    /// Concurrent edits by other connections to any part of the old value
    /// are overwritten; prefer [`update`](Self::update) for shared data.
    pub fn set_value(&self, value: T) {
        match serde_json::to_value(&value) {
            Ok(json) => self.write(Update::Replace(json)),
            Err(e) => tracing::warn!("Dropping unserializable value for {}: {}", self.element, e),
        }
    }

    /// Edits the value in place. Only the paths the mutator touches are
    /// written, so concurrent edits elsewhere survive the merge.
    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Draft),
    {
        let current = match serde_json::to_value(self.value()) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!("Cannot draft element {}: {}", self.element, e);
                return;
            }
        };
        let mut draft = Draft::new(current);
        mutator(&mut draft);
        let patches = draft.into_patches();
        if !patches.is_empty() {
            self.write(Update::Patches(patches));
        }
    }

    fn write(&self, update: Update) {
        let result = {
            let mut state = self.room.shared.lock();
            let result = state.store.write(&self.element, update);
            if matches!(&result, Ok(outcome) if outcome.applied > 0) {
                state.notify(self.element.as_str());
            }
            result
        };

        match result {
            Ok(outcome) if outcome.applied > 0 => {
                self.room.send(Command::Document(self.element.clone()))
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Write to element {} failed: {}", self.element, e),
        }
    }

    /// The element's awareness payloads across the room, local first.
    /// Payloads that do not decode as `A` are skipped.
    pub fn awareness(&self) -> Vec<PeerAwareness<A>> {
        let entries = self.room.shared.lock().awareness.element_entries(&self.element);
        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry.payload) {
                Ok(state) => Some(PeerAwareness {
                    peer: entry.peer,
                    is_local: entry.is_local,
                    player: entry.player,
                    state,
                }),
                Err(e) => {
                    tracing::debug!("Skipping awareness from {}: {}", entry.peer, e);
                    None
                }
            })
            .collect()
    }

    pub fn my_awareness(&self) -> Option<A> {
        let state = self.room.shared.lock();
        let payload = state
            .awareness
            .local_state()
            .elements
            .get(self.element.as_str())?
            .clone();
        serde_json::from_value(payload).ok()
    }

    /// Replaces this connection's payload for the element and broadcasts it.
    pub fn set_my_awareness(&self, payload: A) {
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping unserializable awareness for {}: {}", self.element, e);
                return;
            }
        };
        {
            let mut state = self.room.shared.lock();
            state.awareness.set_element(&self.element, payload);
            state.notify(self.element.as_str());
        }
        self.room.send(Command::Awareness);
    }

    /// Whether the element's first remote snapshot has been merged.
    pub fn has_synced(&self) -> bool {
        self.room.shared.lock().store.is_synced(&self.element)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.room.shared.lock().store.has_pending_writes(&self.element)
    }

    /// Resolves on the next change to this element's value, sync status
    /// or awareness. Changes to other elements do not wake it.
    pub async fn changed(&mut self) {
        // The sender lives in the room, which this handle keeps alive.
        let _ = self.changes.changed().await;
    }

    /// A receiver for the same notifications as [`changed`](Self::changed).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }
}

impl<T, A> Drop for ElementHandle<T, A> {
    fn drop(&mut self) {
        let cleared = {
            let mut state = self.room.shared.lock();
            if state.store.unbind(&self.element) == 0 {
                let cleared = state.awareness.clear_element(&self.element).is_some();
                if cleared {
                    state.notify(self.element.as_str());
                }
                cleared
            } else {
                false
            }
        };
        if cleared {
            self.room.send(Command::Awareness);
        }
    }
}

/// Entry point: one room per room id, sharing one player identity.
pub struct Client {
    config: Option<ClientConfig>,
    player: PlayerIdentity,
    default_room: RoomId,
    rooms: Mutex<HashMap<RoomId, Room>>,
}

impl Client {
    /// Validates the configuration up front; connections open lazily.
    pub fn new(
        config: ClientConfig,
        default_room: RoomId,
        player: PlayerIdentity,
    ) -> Result<Self, SyncError> {
        config.sync_url()?;
        Ok(Self {
            config: Some(config),
            player,
            default_room,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// A client whose rooms never connect.
    pub fn offline(default_room: RoomId, player: PlayerIdentity) -> Self {
        Self {
            config: None,
            player,
            default_room,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn player(&self) -> &PlayerIdentity {
        &self.player
    }

    pub fn default_room_id(&self) -> &RoomId {
        &self.default_room
    }

    /// The room with this id, connecting it on first use.
    pub fn room(&self, id: &RoomId) -> Result<Room, SyncError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get(id) {
            return Ok(room.clone());
        }

        let room = match &self.config {
            Some(config) => Room::connect(config, id.clone(), self.player.clone())?,
            None => Room::offline(id.clone(), self.player.clone()),
        };
        rooms.insert(id.clone(), room.clone());
        Ok(room)
    }

    /// Binds in the options' room, or the default room.
    pub fn bind<T, A>(&self, options: BindOptions<T, A>) -> Result<ElementHandle<T, A>, BindError>
    where
        T: Serialize + DeserializeOwned + Clone,
        A: Serialize + DeserializeOwned + Clone,
    {
        let room_id = options.room.clone().unwrap_or_else(|| self.default_room.clone());
        let room = self.room(&room_id)?;
        room.bind(options)
    }
}
