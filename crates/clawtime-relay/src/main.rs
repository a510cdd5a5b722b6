//! `ClawTime` Relay Server
//!
//! Bridges browser chat clients to the agent gateway over end-to-end
//! encrypted WebSockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use clawtime_core::HistoryStore;
use clawtime_core::config::load_config;
use clawtime_core::tracing_init::init_tracing;
use clawtime_relay::auth::JsonSessionStore;
use clawtime_relay::gateway::{AppState, router};
use clawtime_relay::runs::RunTracker;

#[derive(Parser, Debug)]
#[command(name = "clawtime-relay")]
#[command(version, about = "ClawTime relay server - encrypted chat gateway to the agent")]
struct Args {
    /// Address to listen on (overrides config).
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to a JSON config file.
    #[arg(long, env = "CLAWTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Agent gateway WebSocket URL (overrides config).
    #[arg(long)]
    agent_url: Option<String>,

    /// Directory holding history, run-id and session files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("clawtime_relay=info", args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr.to_string();
    }
    if let Some(url) = args.agent_url {
        config.agent.url = url;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = Some(dir);
    }
    let addr: SocketAddr = config.server.addr.parse()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        agent_url = %config.agent.url,
        "Starting clawtime-relay"
    );

    let storage = &config.storage;
    info!(dir = %storage.data_dir().display(), "Using data directory");
    let runs = Arc::new(RunTracker::load(&storage.run_ids_path()));
    let history = Arc::new(HistoryStore::open(&storage.history_path())?);
    let sessions = Arc::new(JsonSessionStore::new(storage.sessions_path()));
    let sweep_window = Duration::from_secs(config.auth.failure_window_secs.max(1));

    let state = AppState::new(config, sessions, runs, history)?;

    // Drop rate-limit entries whose window has passed
    let limiter = Arc::clone(&state.rate_limiter);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_window);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let removed = limiter.sweep();
            if removed > 0 {
                info!(removed, "Rate-limit table swept");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Relay server listening");
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                warn!(error = %e, "Server error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Relay stopped");
    Ok(())
}
