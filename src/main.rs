use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{
    ConfigCommand, GetCommand, PresenceCommand, SetCommand, StatusCommand, WatchCommand,
};
use sharedstate::config::Config;

#[derive(Parser)]
#[command(name = "sharedstate")]
#[command(version)]
#[command(about = "Inspect and edit shared element state on a sync server", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an element's value
    Get(GetCommand),

    /// Replace an element's value
    Set(SetCommand),

    /// Follow an element's value
    Watch(WatchCommand),

    /// List the connections in a room
    Presence(PresenceCommand),

    /// Check the sync server
    Status(StatusCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharedstate=warn,sharedstate_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Get(cmd)) => cmd.run(&config).await?,
        Some(Commands::Set(cmd)) => cmd.run(&config).await?,
        Some(Commands::Watch(cmd)) => cmd.run(&config).await?,
        Some(Commands::Presence(cmd)) => cmd.run(&config).await?,
        Some(Commands::Status(cmd)) => cmd.run(&config).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
