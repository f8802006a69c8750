//! cardmind-relay binary.
//!
//! Serves the sync relay on a WebSocket port until interrupted. Every flag
//! can also be set through a `CARDMIND_RELAY_*` environment variable.

use std::path::PathBuf;

use cardmind_relay::{RelayServer, ServerConfig};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "cardmind-relay")]
#[command(about = "Collaborative document sync relay")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CARDMIND_RELAY_BIND", default_value = "127.0.0.1:1234")]
    bind: String,

    /// Directory for the RocksDB update store; in-memory when omitted
    #[arg(long, env = "CARDMIND_RELAY_STORAGE", value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Frames buffered per connection before it is dropped as too slow
    #[arg(long, env = "CARDMIND_RELAY_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Commands buffered per document session
    #[arg(long, env = "CARDMIND_RELAY_SESSION_QUEUE", default_value_t = 1024)]
    session_queue: usize,

    /// Seconds of silence before an awareness client is removed
    #[arg(long, env = "CARDMIND_RELAY_AWARENESS_TIMEOUT", default_value_t = 30)]
    awareness_timeout: u64,

    /// Seconds between awareness sweeps
    #[arg(long, env = "CARDMIND_RELAY_SWEEP_INTERVAL", default_value_t = 5)]
    sweep_interval: u64,

    /// Keep every update instead of compacting when a document closes
    #[arg(long, env = "CARDMIND_RELAY_NO_COMPACT")]
    no_compact: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "CARDMIND_RELAY_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            outbound_capacity: self.outbound_capacity,
            session_queue_capacity: self.session_queue,
            awareness_timeout_secs: self.awareness_timeout,
            awareness_sweep_interval_secs: self.sweep_interval,
            storage_path: self.storage.clone(),
            compact_on_close: !self.no_compact,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("Starting cardmind-relay...");

    let server = RelayServer::new(args.server_config())?;
    let listener = TcpListener::bind(server.bind_addr()).await?;

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
