//! CLI for Feedcast
//!
//! Subcommands:
//! - `server`: run the WebSocket server
//! - `client`: subscribe to one bars topic and print what arrives (useful for
//!   smoke tests)

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

use feedcast::app::run_server;
use feedcast::config::load_config;
use feedcast::utils::logging;

#[derive(Parser)]
#[command(name = "feedcast")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Subscribe to bars for one symbol and print the updates
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "AAPL")]
        symbol: String,
        #[arg(long, default_value = "1")]
        resolution: String,
        /// Number of updates to print before unsubscribing
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            let settings = match load_config() {
                Ok(settings) => settings,
                Err(e) => {
                    logging::init("info");
                    error!("Failed to load configuration: {}", e);
                    std::process::exit(1);
                }
            };
            logging::init(&settings.log.level);
            if let Err(e) = run_server(settings).await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Client {
            url,
            symbol,
            resolution,
            count,
        } => {
            logging::init("info");
            if let Err(e) = run_client(&url, &symbol, &resolution, count).await {
                error!("Client failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_client(
    url: &str,
    symbol: &str,
    resolution: &str,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;
    info!("Connected to {url}");

    let payload = json!({ "symbol": symbol, "resolution": resolution });
    let subscribe = json!({ "type": "bars.subscribe", "payload": payload, "request_id": "cli" });
    ws_stream
        .send(WsMessage::text(subscribe.to_string()))
        .await?;

    let mut updates = 0;
    while updates < count {
        let Some(frame) = ws_stream.next().await else {
            info!("Server closed the connection");
            return Ok(());
        };
        let WsMessage::Text(text) = frame? else {
            continue;
        };
        let message: Value = serde_json::from_str(text.as_str())?;
        match message["type"].as_str() {
            Some("bars.update") => {
                updates += 1;
                println!("{}", message["payload"]["data"]);
            }
            Some(kind) => println!("{kind}: {}", message["payload"]),
            None => println!("{text}"),
        }
    }

    let unsubscribe = json!({ "type": "bars.unsubscribe", "payload": payload });
    ws_stream
        .send(WsMessage::text(unsubscribe.to_string()))
        .await?;
    // updates already in flight may arrive before the reply
    while let Some(frame) = ws_stream.next().await {
        let WsMessage::Text(text) = frame? else {
            continue;
        };
        let message: Value = serde_json::from_str(text.as_str())?;
        if message["type"] == "bars.unsubscribe.response" {
            println!("{text}");
            break;
        }
    }
    ws_stream.close(None).await?;
    Ok(())
}
