//! Show who is in a room.

use clap::Args;
use serde_json::json;
use sharedstate_core::AwarenessEntry;
use std::time::Duration;

use super::{open_room, wait_synced, CommandError, OutputFormat};
use sharedstate::config::Config;

/// List the connections present in a room
#[derive(Args)]
pub struct PresenceCommand {
    /// Room (defaults to the configured room)
    #[arg(long, short)]
    room: Option<String>,

    /// Milliseconds to wait for the room's awareness snapshot
    #[arg(long, default_value = "500")]
    wait: u64,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl PresenceCommand {
    pub async fn run(&self, config: &Config) -> Result<(), CommandError> {
        let room = open_room(config, self.room.as_deref())?;
        wait_synced(&room, Duration::from_secs(10)).await?;
        // The snapshot follows the handshake; give it a moment to land.
        tokio::time::sleep(Duration::from_millis(self.wait)).await;

        let entries: Vec<AwarenessEntry> = room
            .awareness()
            .into_iter()
            .filter(|entry| !entry.is_local)
            .collect();

        match self.format {
            OutputFormat::Json => {
                let peers: Vec<_> = entries
                    .iter()
                    .map(|entry| json!({ "peer": entry.peer, "state": entry.state }))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&peers).map_err(CommandError::InvalidJson)?
                );
            }
            OutputFormat::Text => {
                println!("Room {}", room.id());
                println!();
                if entries.is_empty() {
                    println!("Nobody else is here.");
                }
                for entry in &entries {
                    let player = &entry.state.player;
                    println!(
                        "{}  {} {}",
                        entry.peer,
                        player.color,
                        format!("{:?}", player.style).to_lowercase()
                    );
                    if let Some(cursor) = &entry.state.cursor {
                        println!("  cursor: ({:.0}, {:.0})", cursor.x, cursor.y);
                    }
                    for (element, payload) in &entry.state.elements {
                        println!("  {}: {}", element, payload);
                    }
                }
            }
        }
        Ok(())
    }
}
