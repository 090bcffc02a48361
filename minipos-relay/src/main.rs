//! MiniPOS relay: the central WebSocket server every terminal connects to.
//!
//! Reads `MINIPOS_BIND`, `PORT`, `MINIPOS_WS_PATH`,
//! `MINIPOS_BROADCAST_CAPACITY` and `MINIPOS_SYNC_LOG_LIMIT` from the
//! environment (or a `.env` file) and serves until Ctrl-C.

use log::{error, info};
use minipos_sync::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    let server = RelayServer::new(config);
    info!(
        "MiniPOS relay starting on {} (WebSocket {}, health {})",
        server.bind_addr(),
        server.config().ws_path,
        server.config().health_path
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections and {} relayed messages",
                stats.total_connections, stats.relayed_messages
            );
        }
    }
}
