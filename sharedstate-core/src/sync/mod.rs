//! Room-addressed WebSocket sync.
//!
//! ## Protocol
//!
//! 1. Connect to the sync endpoint
//! 2. Send `join` with a fresh peer ID and the room
//! 3. Receive `peer` with the server's peer ID
//! 4. For each bound document, send `request`, then `sync` messages
//! 5. Exchange `awareness` messages alongside document sync
//! 6. Messages are CBOR-encoded

pub(crate) mod client;
mod error;
mod protocol;

pub use client::{
    check_server, Backoff, BackoffConfig, ClientConfig, ConnectionState, HealthStatus,
};
pub use error::SyncError;
pub use protocol::{generate_peer_id, PeerMetadata, ProtocolMessage, PROTOCOL_VERSION};
