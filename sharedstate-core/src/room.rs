//! Room handles.
//!
//! A [`Room`] is the explicit context every binding goes through. It owns
//! the room's document store and awareness set and, when connected, a
//! background task driving one WebSocket connection for all of them.
//! Clones share the same state; the connection shuts down once the last
//! clone and the last element handle are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use automerge::ActorId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::awareness::{Awareness, AwarenessChange, AwarenessEntry, Point};
use crate::element::{ElementId, RoomId};
use crate::player::PlayerIdentity;
use crate::proximity::{
    dispatch, ProximityConfig, ProximityConfigError, ProximityEngine, ProximityEvent,
    ProximityHandler,
};
use crate::store::DocumentStore;
use crate::sync::{generate_peer_id, ClientConfig, ConnectionState, SyncError};

/// Default period of the proximity scanner, roughly one frame at 60 Hz.
pub const DEFAULT_SCAN_PERIOD: Duration = Duration::from_millis(16);

/// Work for the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// An element's document changed locally or was newly bound.
    Document(ElementId),
    /// The local awareness state changed.
    Awareness,
}

type SharedHandler = Arc<Mutex<Box<dyn ProximityHandler>>>;

struct ProximityRegistration {
    id: u64,
    engine: ProximityEngine,
    handler: SharedHandler,
}

pub(crate) struct RoomState {
    pub(crate) store: DocumentStore,
    pub(crate) awareness: Awareness,
    notifiers: HashMap<String, watch::Sender<u64>>,
    proximity: Vec<ProximityRegistration>,
    next_registration: u64,
    /// Elements whose first sync gates the room-level synced flag.
    pub(crate) initial: Option<HashSet<ElementId>>,
}

impl RoomState {
    /// Wakes subscribers of one element.
    pub(crate) fn notify(&self, element: &str) {
        if let Some(notifier) = self.notifiers.get(element) {
            notifier.send_modify(|version| *version += 1);
        }
    }

    pub(crate) fn notify_awareness(&self, changes: &[AwarenessChange]) {
        for change in changes {
            for element in &change.elements {
                self.notify(element);
            }
        }
    }

    pub(crate) fn subscribe(&mut self, element: &ElementId) -> watch::Receiver<u64> {
        self.notifiers
            .entry(element.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }
}

pub(crate) struct Shared {
    pub(crate) room: RoomId,
    state: Mutex<RoomState>,
    pub(crate) synced: watch::Sender<bool>,
    pub(crate) connection: watch::Sender<ConnectionState>,
}

impl Shared {
    fn new(room: RoomId, player: PlayerIdentity) -> Self {
        let store = DocumentStore::new(room.clone(), ActorId::random());
        let awareness = Awareness::new(generate_peer_id(), player);
        Self {
            room,
            state: Mutex::new(RoomState {
                store,
                awareness,
                notifiers: HashMap::new(),
                proximity: Vec::new(),
                next_registration: 0,
                initial: None,
            }),
            synced: watch::channel(false).0,
            connection: watch::channel(ConnectionState::Disconnected).0,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flips the room-level synced flag. It never goes back.
    pub(crate) fn mark_synced(&self) {
        let flipped = self.synced.send_if_modified(|synced| {
            let was = *synced;
            *synced = true;
            !was
        });
        if flipped {
            tracing::info!("room {} has synced", self.room);
        }
    }

    fn scan_proximity(&self, now: Instant) -> usize {
        let batches: Vec<(SharedHandler, Vec<ProximityEvent>)> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state
                .proximity
                .iter_mut()
                .map(|r| (r.handler.clone(), r.engine.scan(&state.awareness, now)))
                .filter(|(_, events)| !events.is_empty())
                .collect()
        };

        let mut delivered = 0;
        for (handler, events) in batches {
            let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
            dispatch(handler.as_mut(), &events);
            delivered += events.len();
        }
        delivered
    }
}

/// Handle to one room.
#[derive(Clone)]
pub struct Room {
    pub(crate) shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Room {
    /// Opens a room and starts its connection in the background.
    ///
    /// Fails immediately on an invalid server url or outside a tokio
    /// runtime. Connection problems after that are retried with backoff.
    pub fn connect(
        config: &ClientConfig,
        room: RoomId,
        player: PlayerIdentity,
    ) -> Result<Self, SyncError> {
        let url = config.sync_url()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let shared = Arc::new(Shared::new(room, player));
        let (commands, receiver) = mpsc::unbounded_channel();
        runtime.spawn(crate::sync::client::run(
            shared.clone(),
            config.clone(),
            url,
            receiver,
        ));

        Ok(Self { shared, commands })
    }

    /// A room with no transport. Writes stay local.
    pub fn offline(room: RoomId, player: PlayerIdentity) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::new(room, player)),
            commands,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.shared.room
    }

    /// Connection id of the current (or next) connection attempt.
    pub fn peer_id(&self) -> String {
        self.shared.lock().awareness.local_peer().to_string()
    }

    /// Whether the first connection's snapshot has been merged.
    pub fn has_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Resolves once the room has synced.
    pub async fn synced(&self) {
        let mut receiver = self.shared.synced.subscribe();
        let _ = receiver.wait_for(|synced| *synced).await;
    }

    /// Receiver for the synced flag. It changes at most once, to `true`.
    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.shared.synced.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    /// All awareness entries of the room, the local one first.
    pub fn awareness(&self) -> Vec<AwarenessEntry> {
        self.shared.lock().awareness.entries()
    }

    pub fn set_cursor(&self, cursor: Option<Point>) {
        self.shared.lock().awareness.set_cursor(cursor);
        self.send(Command::Awareness);
    }

    /// Registers a proximity handler. Dropping the guard unregisters it.
    pub fn configure_proximity<H>(
        &self,
        config: ProximityConfig,
        handler: H,
    ) -> Result<ProximityGuard, ProximityConfigError>
    where
        H: ProximityHandler + 'static,
    {
        let engine = ProximityEngine::new(config)?;
        let mut state = self.shared.lock();
        let id = state.next_registration;
        state.next_registration += 1;
        state.proximity.push(ProximityRegistration {
            id,
            engine,
            handler: Arc::new(Mutex::new(Box::new(handler))),
        });

        Ok(ProximityGuard {
            shared: Arc::downgrade(&self.shared),
            id,
        })
    }

    /// Runs one proximity scan and dispatches its events. Returns the
    /// number of events delivered.
    pub fn scan_proximity(&self, now: Instant) -> usize {
        self.shared.scan_proximity(now)
    }

    /// Scans periodically until the room is dropped.
    pub fn run_proximity_scanner(&self, period: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.scan_proximity(Instant::now());
            }
        })
    }

    pub(crate) fn send(&self, command: Command) {
        // Offline rooms have no receiver.
        let _ = self.commands.send(command);
    }
}

/// Keeps a proximity handler registered.
pub struct ProximityGuard {
    shared: Weak<Shared>,
    id: u64,
}

impl Drop for ProximityGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock().proximity.retain(|r| r.id != self.id);
        }
    }
}
