mod config_cmd;
mod doc;
mod presence;
mod status;

pub use config_cmd::ConfigCommand;
pub use doc::{GetCommand, SetCommand, WatchCommand};
pub use presence::PresenceCommand;
pub use status::StatusCommand;

use clap::ValueEnum;
use sharedstate_core::{
    BindError, ClientConfig, FileStore, IdentityError, PlayerIdentity, PlayerStoreError, Room,
    RoomId, SyncError,
};
use std::time::Duration;

use sharedstate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Errors from CLI commands
#[derive(Debug)]
pub enum CommandError {
    IdentityError(PlayerStoreError),
    InvalidRoom(IdentityError),
    SyncError(SyncError),
    BindError(BindError),
    InvalidJson(serde_json::Error),
    Timeout(&'static str),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::IdentityError(e) => write!(f, "Player identity error: {}", e),
            CommandError::InvalidRoom(e) => write!(f, "Invalid room: {}", e),
            CommandError::SyncError(e) => write!(f, "{}", e),
            CommandError::BindError(e) => write!(f, "{}", e),
            CommandError::InvalidJson(e) => write!(f, "Invalid JSON: {}", e),
            CommandError::Timeout(what) => write!(f, "Timed out waiting for {}", what),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::IdentityError(e) => Some(e),
            CommandError::InvalidRoom(e) => Some(e),
            CommandError::SyncError(e) => Some(e),
            CommandError::BindError(e) => Some(e),
            CommandError::InvalidJson(e) => Some(e),
            CommandError::Timeout(_) => None,
        }
    }
}

impl From<PlayerStoreError> for CommandError {
    fn from(e: PlayerStoreError) -> Self {
        CommandError::IdentityError(e)
    }
}

impl From<IdentityError> for CommandError {
    fn from(e: IdentityError) -> Self {
        CommandError::InvalidRoom(e)
    }
}

impl From<SyncError> for CommandError {
    fn from(e: SyncError) -> Self {
        CommandError::SyncError(e)
    }
}

impl From<BindError> for CommandError {
    fn from(e: BindError) -> Self {
        CommandError::BindError(e)
    }
}

/// Opens the room named on the command line, or the configured one.
fn open_room(config: &Config, room: Option<&str>) -> Result<Room, CommandError> {
    let room = RoomId::parse(room.unwrap_or(&config.room.value))?;
    let player = PlayerIdentity::load_or_create(&FileStore::new(config.identity_path()))?;
    let client_config = ClientConfig::new(config.server_url.value.clone());
    Ok(Room::connect(&client_config, room, player)?)
}

/// Waits for the room's first snapshot.
async fn wait_synced(room: &Room, limit: Duration) -> Result<(), CommandError> {
    tokio::time::timeout(limit, room.synced())
        .await
        .map_err(|_| CommandError::Timeout("the room to sync"))
}
