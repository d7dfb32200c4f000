//! Glimpse Store Server
//!
//! Shared key/value store for session records and signaling queues.
//!
//! # Usage
//!
//! ```bash
//! # In-memory mode (default)
//! glimpse-signal --port 8080
//!
//! # With SQLite persistence
//! glimpse-signal --port 8080 --db /var/lib/glimpse/store.db
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use glimpse_core::{GlimpseConfig, KvStore, MemoryStore, SystemClock, SESSION_PREFIX, SIGNALING_PREFIX};
use glimpse_signal::{SqliteStore, StoreServer};

#[derive(Parser, Debug)]
#[command(name = "glimpse-signal")]
#[command(about = "Glimpse store server for sessions and signaling")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// SQLite database path for persistence (optional, uses in-memory if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GlimpseConfig::load_from(path)
            .with_context(|| format!("failed to load config {:?}", path))?,
        None => GlimpseConfig::load(),
    };
    if let Some(port) = args.port {
        config.signal.port = port;
    }
    if let Some(bind) = &args.bind {
        config.signal.bind = bind.parse().with_context(|| format!("invalid bind address {}", bind))?;
    }
    if args.db.is_some() {
        config.signal.db_path = args.db.clone();
    }

    let addr = SocketAddr::new(config.signal.bind, config.signal.port);

    info!("Starting Glimpse Store Server");

    let store: Arc<dyn KvStore> = match &config.signal.db_path {
        Some(db_path) => {
            // Create parent directory if it doesn't exist
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Using SQLite persistence: {:?}", db_path);
            let sqlite = SqliteStore::open(db_path)?;
            info!(
                "Loaded {} sessions and {} signaling queues from database",
                sqlite.count_prefix(SESSION_PREFIX).unwrap_or(0),
                sqlite.count_prefix(SIGNALING_PREFIX).unwrap_or(0)
            );
            Arc::new(sqlite)
        }
        None => {
            info!("Using in-memory storage (no persistence)");
            Arc::new(MemoryStore::new())
        }
    };

    let server = StoreServer::with_config(store, Arc::new(SystemClock), config);
    server.serve(addr).await?;

    Ok(())
}
