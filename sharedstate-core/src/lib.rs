//! Shared-state synchronization core.
//!
//! Per-element CRDT documents grouped into rooms, an ephemeral awareness
//! channel for presence, cursor proximity detection, and the WebSocket
//! transport that keeps one connection per room.

pub mod awareness;
pub mod binding;
pub mod crdt;
pub mod document_id;
pub mod element;
pub mod player;
pub mod proximity;
pub mod room;
pub mod store;
pub mod sync;

pub use awareness::{Awareness, AwarenessEntry, PeerId, Point, PresenceState};
pub use binding::{BindError, BindOptions, Client, ElementHandle, PeerAwareness};
pub use crdt::{Draft, Patch, Path};
pub use document_id::{room_key, DocumentId, DocumentIdError};
pub use element::{ElementId, ElementPath, IdentityError, RoomId};
pub use player::{FileStore, LocalStore, MemoryStore, PlayerIdentity, PlayerStoreError};
pub use proximity::{
    Callbacks, Encounter, ProximityConfig, ProximityConfigError, ProximityEngine, ProximityEvent,
    ProximityHandler,
};
pub use room::{ProximityGuard, Room, DEFAULT_SCAN_PERIOD};
pub use store::{DocumentStore, StoreError, Update, WriteOutcome};
pub use sync::{
    check_server, BackoffConfig, ClientConfig, ConnectionState, HealthStatus, SyncError,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
