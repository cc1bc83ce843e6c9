//! Sync server and CLI configuration for shared-state rooms.

pub mod config;
pub mod server;
