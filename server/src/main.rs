use clap::Parser;
use log::{error, info, LevelFilter};
use std::sync::Arc;
use std::time::Duration;

use server::config::GameConfig;
use server::hub::Hub;
use server::minigames::standard_registry;
use server::network::Server;
use server::recorder::{JsonLinesSink, RecordSink};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Length of a ship session in seconds
    #[clap(long, default_value = "600", value_parser = clap::value_parser!(u64).range(1..))]
    ship_duration_secs: u64,
    /// Maximum number of concurrent connections
    #[clap(long, default_value = "256")]
    max_clients: usize,
    /// Append a JSON record of every finished session to this file
    #[clap(long, value_name = "PATH")]
    record: Option<String>,
    /// Only start games with two full teams of three
    #[clap(long)]
    strict_lobbies: bool,
    /// Log at debug level
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn game_config(&self) -> GameConfig {
        GameConfig {
            ship_duration: Duration::from_secs(self.ship_duration_secs),
            allow_smaller_lobbies: !self.strict_lobbies,
            ..GameConfig::default()
        }
    }
}

/// Main-method of the application.
/// Parses command-line arguments, then starts the coordination loop and the WebSocket listener.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = args.game_config();
    let registry = standard_registry();
    registry.validate_layout(&config.layout)?;

    let sink: Option<Arc<dyn RecordSink>> = match &args.record {
        Some(path) => {
            info!("Recording sessions to {}", path);
            Some(Arc::new(JsonLinesSink::new(path)))
        }
        None => None,
    };

    let (hub, handle) = Hub::new(config, registry, sink, args.max_clients);

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, handle).await?;

    let hub_handle = tokio::spawn(hub.run());
    let server_handle = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Network task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = hub_handle => {
            if let Err(e) = result {
                error!("Coordination loop panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
