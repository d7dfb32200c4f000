//! Glimpse CLI - share and watch live streams by code
//!
//! Usage:
//!   glimpse host [--title T]          Start a broadcast (loopback media)
//!   glimpse join <code>               Watch a broadcast (loopback media)
//!   glimpse list [query]              List active sessions
//!   glimpse info <code>               Show one session
//!   glimpse create / stop / sweep     Registry maintenance
//!   glimpse code [code-or-link]       Normalize (or generate) a code and print its share link

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use glimpse_core::code::{
    extract_session_id, format_session_id, make_share_link, try_generate_session_id,
};
use glimpse_core::{
    Clock, GlimpseConfig, KvStore, Session, SessionMetadata, SessionStatus, SystemClock,
};
use glimpse_peer::{
    GlimpseContext, HostSession, LocalTrack, LoopbackFactory, SessionEvent, ViewerSession,
};
use glimpse_signal::{RemoteStore, SessionRegistry};

#[derive(Parser)]
#[command(name = "glimpse")]
#[command(about = "Share a live stream with a short code", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store server URL (defaults to the configured one)
    #[arg(short, long, global = true, env = "GLIMPSE_STORE")]
    store: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a broadcast and stay online until Ctrl+C
    Host {
        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        /// Reject joins beyond this many viewers
        #[arg(short, long)]
        max_viewers: Option<u32>,
    },

    /// Watch a broadcast until it ends or Ctrl+C
    Join {
        /// Session code (e.g., BA7Z-UM4E) or share link
        code: String,
    },

    /// Register a session record without hosting it
    Create {
        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        max_viewers: Option<u32>,
    },

    /// List active sessions
    List {
        /// Only sessions whose code, title, or description contains this
        query: Option<String>,
    },

    /// Show one session
    Info { code: String },

    /// Mark a session inactive
    Stop { code: String },

    /// Delete expired session records
    Sweep,

    /// Active session and viewer totals
    Stats,

    /// Normalize a code or link and print the share link (or make a fresh code)
    Code { input: Option<String> },

    /// Print a sample configuration file
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => GlimpseConfig::load_from(path)
            .with_context(|| format!("failed to load config {:?}", path))?,
        None => GlimpseConfig::load(),
    };

    // Commands that never touch the store
    match &cli.command {
        Commands::Code { input } => return print_code(&config, input.as_deref()),
        Commands::Config => {
            print!("{}", GlimpseConfig::sample());
            return Ok(());
        }
        _ => {}
    }

    let url = cli.store.clone().unwrap_or_else(|| config.client.store_url.clone());
    let store: Arc<dyn KvStore> = Arc::new(
        RemoteStore::connect_with_timeout(&url, config.client.request_timeout())
            .await
            .with_context(|| format!("failed to reach store at {}", url))?,
    );
    let ctx = GlimpseContext::with_config(
        store,
        Arc::new(SystemClock),
        config,
        Arc::new(LoopbackFactory::new()),
    );

    match cli.command {
        Commands::Host {
            title,
            description,
            max_viewers,
        } => {
            let metadata = SessionMetadata {
                title,
                description,
                max_viewers,
            };
            run_host(&ctx, metadata).await
        }
        Commands::Join { code } => run_join(&ctx, &code).await,
        Commands::Create { title, max_viewers } => {
            let metadata = SessionMetadata {
                title,
                description: None,
                max_viewers,
            };
            let session = ctx.registry().create_session("cli", Some(metadata)).await;
            println!("{}", format_session_id(&session.id));
            println!(
                "{}",
                make_share_link(&ctx.config().client.share_base_url, &session.id)
            );
            Ok(())
        }
        Commands::List { query } => {
            let sessions = match query {
                Some(q) => ctx.registry().search_active(&q).await,
                None => ctx.registry().list_active().await,
            };
            if sessions.is_empty() {
                println!("No active sessions");
            }
            for session in &sessions {
                print_session_line(session);
            }
            Ok(())
        }
        Commands::Info { code } => {
            let session = lookup(ctx.registry(), &code).await?;
            print_session_details(&session);
            Ok(())
        }
        Commands::Stop { code } => {
            let id = parse_code(&code)?;
            if !ctx
                .registry()
                .update_status(&id, SessionStatus::Inactive)
                .await
            {
                bail!("session {} not found", format_session_id(&id));
            }
            println!("Stopped {}", format_session_id(&id));
            Ok(())
        }
        Commands::Sweep => {
            let removed = ctx.registry().sweep_expired().await;
            println!("Removed {} expired sessions", removed);
            Ok(())
        }
        Commands::Stats => {
            let stats = ctx.registry().stats().await;
            println!("Active sessions: {}", stats.active_sessions);
            println!("Total viewers:   {}", stats.total_viewers);
            if let Some(minutes) = stats.longest_uptime_minutes(ctx.registry().clock().now_ms()) {
                println!("Longest running: {} min", minutes);
            }
            Ok(())
        }
        Commands::Code { .. } | Commands::Config => Ok(()),
    }
}

async fn run_host(ctx: &GlimpseContext, metadata: SessionMetadata) -> anyhow::Result<()> {
    let host = HostSession::start(ctx, Some(metadata), LocalTrack::screen_capture()).await;
    let mut events = host.subscribe();

    info!("");
    info!("  Session code: {}", host.code());
    info!("  Share link:   {}", host.share_link());
    info!("");
    info!("  Run on another machine:");
    info!("    glimpse join {}", host.code());
    info!("");

    // Handle Ctrl+C
    tokio::select! {
        _ = log_events(&mut events) => {}
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    host.stop().await;
    Ok(())
}

async fn run_join(ctx: &GlimpseContext, input: &str) -> anyhow::Result<()> {
    let viewer = match ViewerSession::join(ctx, input).await {
        Ok(viewer) => viewer,
        Err(e) => {
            error!(code = ?e.code(), "Could not join: {}", e);
            return Err(e.into());
        }
    };
    let mut events = viewer.subscribe();

    info!("Watching {} as {}", viewer.code(), viewer.viewer_id());

    tokio::select! {
        _ = log_events(&mut events) => {}
        _ = signal::ctrl_c() => {
            info!("Leaving...");
        }
    }

    viewer.leave().await;
    Ok(())
}

/// Log session events until the session ends
async fn log_events(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ViewerJoined { viewer_id }) => info!("Viewer {} joining", viewer_id),
            Ok(SessionEvent::ViewerConnected { viewer_id }) => {
                info!("Viewer {} connected", viewer_id)
            }
            Ok(SessionEvent::ViewerLeft { viewer_id, reason }) => {
                info!("Viewer {} left ({:?})", viewer_id, reason)
            }
            Ok(SessionEvent::StateChanged(state)) => info!("Connection {:?}", state),
            Ok(SessionEvent::RemoteTrack(track)) => {
                info!("Receiving {} track {}", track.kind, track.id)
            }
            Ok(SessionEvent::HostLost { reason }) => warn!("Host gone ({:?})", reason),
            Ok(SessionEvent::Ended) => {
                info!("Session ended");
                return;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_code(config: &GlimpseConfig, input: Option<&str>) -> anyhow::Result<()> {
    let id = match input {
        Some(input) => parse_code(input)?,
        None => try_generate_session_id().context("system random source unavailable")?,
    };
    println!("{}", format_session_id(&id));
    println!("{}", make_share_link(&config.client.share_base_url, &id));
    Ok(())
}

fn parse_code(input: &str) -> anyhow::Result<String> {
    extract_session_id(input).with_context(|| format!("invalid session code: {}", input))
}

async fn lookup(registry: &SessionRegistry, input: &str) -> anyhow::Result<Session> {
    let id = parse_code(input)?;
    registry
        .get_session(&id)
        .await
        .with_context(|| format!("session {} not found or expired", format_session_id(&id)))
}

fn title_of(session: &Session) -> &str {
    session
        .metadata
        .as_ref()
        .and_then(|m| m.title.as_deref())
        .unwrap_or("-")
}

fn print_session_line(session: &Session) {
    let capacity = session
        .max_viewers()
        .map(|max| format!("/{}", max))
        .unwrap_or_default();
    println!(
        "{}  {:>3}{} viewers  {}",
        format_session_id(&session.id),
        session.viewer_count(),
        capacity,
        title_of(session)
    );
}

fn print_session_details(session: &Session) {
    let created = Utc
        .timestamp_millis_opt(session.created_at)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| session.created_at.to_string());

    println!("Code:     {}", format_session_id(&session.id));
    println!("Status:   {}", session.status);
    println!("Host:     {}", session.host_id);
    println!("Created:  {}", created);
    println!("Title:    {}", title_of(session));
    if let Some(desc) = session.metadata.as_ref().and_then(|m| m.description.as_deref()) {
        println!("About:    {}", desc);
    }
    println!("Viewers:  {}", session.viewer_count());
    for viewer in &session.viewers {
        println!("  - {}", viewer);
    }
}
