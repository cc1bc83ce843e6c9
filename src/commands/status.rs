//! Server status.

use clap::Args;
use sharedstate_core::{check_server, ClientConfig};

use super::{CommandError, OutputFormat};
use sharedstate::config::Config;

/// Show the configured server and whether it is reachable
#[derive(Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(&self, config: &Config) -> Result<(), CommandError> {
        let client_config = ClientConfig::new(config.server_url.value.clone());
        let sync_url = client_config.sync_url()?;
        let health = check_server(&client_config).await;

        match self.format {
            OutputFormat::Json => {
                let status = match &health {
                    Ok(health) => serde_json::json!({
                        "server": sync_url,
                        "reachable": true,
                        "status": health.status,
                        "version": health.version,
                    }),
                    Err(e) => serde_json::json!({
                        "server": sync_url,
                        "reachable": false,
                        "error": e.to_string(),
                    }),
                };
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).map_err(CommandError::InvalidJson)?
                );
            }
            OutputFormat::Text => {
                println!("Server:  {}", sync_url);
                println!("Room:    {}", config.room.value);
                match &health {
                    Ok(health) => {
                        println!("Status:  ✓ {} (version {})", health.status, health.version)
                    }
                    Err(e) => println!("Status:  ✗ {}", e),
                }
            }
        }
        Ok(())
    }
}
