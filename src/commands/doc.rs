//! Element value commands: get, set and watch.

use clap::Args;
use serde_json::Value;
use sharedstate_core::{BindOptions, ElementHandle, Room};
use std::time::Duration;

use super::{open_room, wait_synced, CommandError, OutputFormat};
use sharedstate::config::Config;

#[derive(Args)]
pub struct ElementArgs {
    /// Element id
    element: String,

    /// Room (defaults to the configured room)
    #[arg(long, short)]
    room: Option<String>,

    /// Seconds to wait for the server
    #[arg(long, default_value = "10")]
    timeout: u64,
}

impl ElementArgs {
    async fn bind(&self, config: &Config) -> Result<ElementHandle<Value>, CommandError> {
        let room = open_room(config, self.room.as_deref())?;
        let handle = room.bind(BindOptions::new(Value::Null).id(&self.element))?;
        wait_synced(&room, self.limit()).await?;
        Ok(handle)
    }

    fn limit(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Print an element's current value
#[derive(Args)]
pub struct GetCommand {
    #[command(flatten)]
    target: ElementArgs,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl GetCommand {
    pub async fn run(&self, config: &Config) -> Result<(), CommandError> {
        let handle = self.target.bind(config).await?;
        print_value(&handle.value(), &self.format);
        Ok(())
    }
}

/// Replace an element's value
#[derive(Args)]
pub struct SetCommand {
    #[command(flatten)]
    target: ElementArgs,

    /// New value as JSON
    value: String,
}

impl SetCommand {
    pub async fn run(&self, config: &Config) -> Result<(), CommandError> {
        let value: Value = serde_json::from_str(&self.value).map_err(CommandError::InvalidJson)?;
        let mut handle = self.target.bind(config).await?;
        handle.set_value(value);

        tokio::time::timeout(self.target.limit(), async {
            while handle.has_pending_writes() {
                handle.changed().await;
            }
        })
        .await
        .map_err(|_| CommandError::Timeout("the server to acknowledge the write"))?;

        println!("Updated {} in room {}", handle.element(), handle.room().id());
        Ok(())
    }
}

/// Print an element's value every time it changes
#[derive(Args)]
pub struct WatchCommand {
    #[command(flatten)]
    target: ElementArgs,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl WatchCommand {
    pub async fn run(&self, config: &Config) -> Result<(), CommandError> {
        let mut handle = self.target.bind(config).await?;
        let mut last = handle.value();
        print_value(&last, &self.format);
        let mut connection = handle.room().watch_connection();
        connection.borrow_and_update();
        let mut synced = handle.room().watch_synced();

        loop {
            tokio::select! {
                changed = synced.changed(), if !*synced.borrow() => {
                    if changed.is_err() {
                        break;
                    }
                    if *synced.borrow_and_update() {
                        eprintln!("Synced");
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    eprintln!("Connection {:?}", state);
                }
                _ = handle.changed() => {
                    let value = handle.value();
                    if value != last {
                        print_value(&value, &self.format);
                        last = value;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        print_connection_end(handle.room());
        Ok(())
    }
}

fn print_value(value: &Value, format: &OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", value),
        OutputFormat::Text => match value {
            Value::Null => println!("(unset)"),
            Value::String(s) => println!("{}", s),
            other => println!(
                "{}",
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
            ),
        },
    }
}

fn print_connection_end(room: &Room) {
    println!("Stopped watching room {} ({:?})", room.id(), room.connection_state());
}
