//! WebSocket echo server with a heartbeat.
//!
//! Run with: `cargo run --example ws_server`
//! Then connect a client to `ws://127.0.0.1:9001/ws`.
//!
//! Every text message is echoed back, and each connection also receives the
//! text `hi` once per second until it closes.

use std::error::Error;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wsraw::{Config, HandshakeRequest, Message, Router, Server, Upgraded, WebSocket, WsSender};

const ADDR: &str = "127.0.0.1:9001";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn heartbeat(sender: WsSender<Upgraded>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = sender.closed() => break,
            _ = ticker.tick() => {
                if let Some(at) = sender.last_frame() {
                    debug!(idle = ?at.elapsed(), "heartbeat");
                }
                if let Err(err) = sender.send(Message::text("hi")).await {
                    debug!(error = %err, "heartbeat stopped");
                    break;
                }
            }
        }
    }
}

async fn handle(ws: WebSocket<Upgraded>, request: HandshakeRequest) {
    info!(path = request.path(), "client connected");

    let (sender, mut receiver) = ws.split();
    tokio::spawn(heartbeat(sender.clone()));

    loop {
        match receiver.recv().await {
            Ok(Some(msg)) => {
                info!(?msg, "received");
                if let Message::Text(text) = msg {
                    if let Err(err) = sender.send(Message::Text(text)).await {
                        warn!(error = %err, "echo failed");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "connection failed");
                break;
            }
        }
    }

    info!("client disconnected");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let router = Router::new().websocket("/ws", handle);
    let server = Server::bind(ADDR, router, Config::server()).await?;

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
