//! CLI for popchat
//!
//! Subcommands:
//! - `serve`: host the broker over WebSocket
//! - `chat`: join a room from the terminal

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use popchat::broker::{Broker, BrokerConnector, LocalConnector};
use popchat::config::{Settings, load_config, load_config_from};
use popchat::console::{ChatOptions, ConsoleSink};
use popchat::transport::{RemoteConnector, start_websocket_server};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popchat")]
enum Command {
    /// Start the WebSocket broker server
    Serve {
        /// Configuration file to read instead of config/default.toml
        #[arg(long)]
        config: Option<String>,
    },
    /// Chat in a room
    Chat {
        /// Username to chat as; prompted for when missing
        #[arg(long)]
        username: Option<String>,
        /// Room to join (default: chat.default_room)
        #[arg(long)]
        room: Option<String>,
        /// Broker server URL, e.g. ws://127.0.0.1:9092; without it an in-process broker is used
        #[arg(long)]
        url: Option<String>,
        /// Configuration file to read instead of config/default.toml
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    match cmd {
        Command::Serve { config } => {
            popchat::utils::logging::init("info");
            if let Err(e) = run_server(config.as_deref()).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Chat {
            username,
            room,
            url,
            config,
        } => {
            if let Err(e) = run_chat(config.as_deref(), ChatOptions { username, room }, url).await
            {
                error!("Chat failed: {}", e);
                eprintln!("Error: {e}");
            }
        }
    }
}

fn settings(path: Option<&str>) -> Result<Settings, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

async fn run_server(config: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings(config)?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let broker = Broker::from_settings(&settings.broker)?.shared();

    tokio::select! {
        result = start_websocket_server(addr, broker.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server exited: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    popchat::broker::engine::lock(&broker).flush()?;
    Ok(())
}

async fn run_chat(
    config: Option<&str>,
    options: ChatOptions,
    url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings(config)?;
    popchat::utils::logging::init(&settings.chat.log_level);

    let connector: Arc<dyn BrokerConnector> = match url.or_else(|| settings.broker.url.clone()) {
        Some(url) => Arc::new(RemoteConnector::new(
            &url,
            Duration::from_millis(settings.producer.request_timeout_ms),
        )),
        None => Arc::new(LocalConnector::new(
            Broker::from_settings(&settings.broker)?.shared(),
        )),
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    popchat::console::run(
        stdin,
        &mut stdout,
        options,
        connector,
        Arc::new(ConsoleSink),
        settings,
    )
    .await?;
    Ok(())
}
