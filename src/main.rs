//! CLI for Crossbar
//!
//! Subcommands:
//! - `server`: run the broker with its WebSocket adapter
//! - `client`: subscribe to a topic over WebSocket, publish once and print
//!   what comes back (useful for smoke tests)

use clap::Parser;
use crossbar::broker::Broker;
use crossbar::config::{DEFAULT_CONFIG_PATH, load_config_from};
use crossbar::protocol::WebSocketServer;
use crossbar::utils::logging;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "crossbar")]
enum Command {
    /// Start the broker and its WebSocket adapter
    Server {
        /// Configuration file, extension optional
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
    /// Run the smoke-test client
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic to subscribe and publish to
        #[arg(long, default_value = "chat")]
        topic: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    match cmd {
        Command::Server { config } => {
            if let Err(e) = run_server(&config).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client { url, topic } => {
            logging::init("info");
            if let Err(e) = run_client(&url, &topic).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config_from(path)?;
    logging::init(&settings.logging.level);

    let broker = Broker::new(&settings)?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    broker.add_protocol_server(Arc::new(WebSocketServer::new(addr, broker.handles())))?;
    broker.boot().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    broker.shutdown().await;
    Ok(())
}

async fn run_client(url: &str, topic: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;

    let subscribe = json!({ "type": "subscribe", "topic": topic });
    ws_stream
        .send(WsMessage::Text(subscribe.to_string().into()))
        .await?;
    // subscription and publication travel through different queues
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let publish = json!({ "type": "publish", "topic": topic, "payload": "Hello from crossbar" });
    ws_stream
        .send(WsMessage::Text(publish.to_string().into()))
        .await?;

    if let Some(Ok(WsMessage::Text(incoming))) = ws_stream.next().await {
        println!("Incoming: {incoming}");
    }
    ws_stream.close(None).await?;
    Ok(())
}
