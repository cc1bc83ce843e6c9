//! Room-addressed sync server.

pub mod hub;
pub mod session;
pub mod storage;
pub mod ws;

pub use hub::{RoomChannel, RoomEvent, RoomHub, SessionError};
pub use session::ClientSession;
pub use storage::{ServerStorage, ServerStorageError};
pub use ws::{router, AppState};
