//! `ClawTime` terminal client
//!
//! Reads chat lines from stdin and prints the agent's streamed replies.

use std::io::{BufRead, Write};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use clawtime_client::{ClientEvent, ClientRunner, ReconnectPolicy, RunnerConfig, Status};
use clawtime_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "clawtime")]
#[command(version, about = "ClawTime terminal client - encrypted chat with the agent")]
struct Args {
    /// Relay WebSocket URL.
    #[arg(long, env = "CLAWTIME_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Session token.
    #[arg(long, env = "CLAWTIME_TOKEN")]
    token: String,

    /// Origin header to present (defaults to the relay's own origin).
    #[arg(long)]
    origin: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("clawtime_client=info", args.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), url = %args.url, "Starting clawtime");

    let (input_tx, input_rx) = mpsc::channel::<String>(16);
    let (events_tx, mut events) = mpsc::channel::<ClientEvent>(64);

    // Blocking stdin reader; closing stdin stops the client.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if input_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let config = RunnerConfig {
        url: args.url,
        token: args.token,
        origin: args.origin,
        policy: ReconnectPolicy::default(),
    };
    let runner = tokio::spawn(ClientRunner::new(config, events_tx).run(input_rx));

    let mut stdout = std::io::stdout();
    // Text already printed for the run currently streaming.
    let mut printed = String::new();
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Status(status) => match status {
                Status::Connected => info!("Connected"),
                Status::Reconnecting { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis(), "Reconnecting");
                }
                other => info!(status = ?other, "Connection status"),
            },
            ClientEvent::Chat {
                state, text, error, ..
            } => match state.as_str() {
                "delta" => {
                    let text = text.unwrap_or_default();
                    if let Some(suffix) = text.strip_prefix(printed.as_str()) {
                        write!(stdout, "{suffix}")?;
                    } else {
                        write!(stdout, "\n{text}")?;
                    }
                    stdout.flush()?;
                    printed = text;
                }
                "final" => {
                    let text = text.unwrap_or_default();
                    let suffix = text.strip_prefix(printed.as_str()).unwrap_or(&text);
                    writeln!(stdout, "{suffix}")?;
                    printed.clear();
                }
                _ => {
                    if !printed.is_empty() {
                        writeln!(stdout)?;
                    }
                    printed.clear();
                    warn!(state = %state, error = ?error, "Reply did not complete");
                }
            },
            ClientEvent::AuthFailed(reason) => {
                warn!(reason = %reason, "Authentication failed");
            }
            ClientEvent::Frame(frame) => {
                tracing::debug!(%frame, "Relay frame");
            }
        }
    }

    runner.await?;
    info!("Client stopped");
    Ok(())
}
