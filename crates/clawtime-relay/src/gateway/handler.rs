//! WebSocket upgrade and the per-socket read, write and liveness tasks.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::{Connection, Flow};
use super::origin::{client_ip, request_origin_allowed};
use super::server::AppState;
use super::sink::{ClientSink, Outbound};
use super::{CLOSE_ORIGIN, CLOSE_STALE};

const OUTBOUND_CAPACITY: usize = 256;
/// How long a closing socket may take to flush its final frames.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let server = &state.config.server;
    let allowed = request_origin_allowed(&headers, peer, &server.allowed_origins);
    let ip = client_ip(&headers, peer, server.trust_proxy);
    if !allowed {
        warn!(
            peer = %peer,
            origin = ?headers.get(axum::http::header::ORIGIN),
            "Rejected WebSocket origin"
        );
    }
    ws.max_message_size(server.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            if allowed {
                handle_socket(socket, state, ip).await;
            } else {
                reject(socket, CLOSE_ORIGIN, "origin not allowed").await;
            }
        })
}

async fn reject(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        let (message, closing) = match item {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if ws_tx.send(message).await.is_err() || closing {
            break;
        }
    }
}

/// Ping every `interval`; close the socket if no pong arrived within `grace`.
async fn heartbeat(
    sink: ClientSink,
    last_pong: Arc<Mutex<Instant>>,
    interval: Duration,
    grace: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick
    loop {
        ticker.tick().await;
        let sent = Instant::now();
        if sink.ping().await.is_err() {
            return;
        }
        tokio::time::sleep(grace).await;
        let seen = *last_pong.lock().unwrap_or_else(PoisonError::into_inner);
        if seen < sent {
            warn!("No pong within grace period, closing stale connection");
            if let Err(e) = sink.close(CLOSE_STALE, "stale connection").await {
                debug!(error = %e, "Stale connection already gone");
            }
            return;
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, ip: IpAddr) {
    let server = state.config.server.clone();
    let (ws_tx, mut ws_rx) = socket.split();
    let (sink, outbound) = ClientSink::channel(OUTBOUND_CAPACITY);
    let conn = Arc::new(Connection::new(state, ip, sink.clone()));
    let visitor_id = conn.visitor_id().to_string();
    info!(visitor_id = %visitor_id, ip = %ip, "Client connected");

    let mut writer = tokio::spawn(write_loop(ws_tx, outbound));
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let mut liveness = tokio::spawn(heartbeat(
        sink.clone(),
        Arc::clone(&last_pong),
        Duration::from_secs(server.ping_interval_secs.max(1)),
        Duration::from_secs(server.pong_grace_secs),
    ));

    let mut closing = false;
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = &mut liveness => {
                closing = true;
                break;
            }
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Pong(_))) => {
                *last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                continue;
            }
            Some(Ok(Message::Binary(_) | Message::Ping(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                debug!(visitor_id = %visitor_id, ?frame, "Client closed socket");
                break;
            }
            Some(Err(e)) => {
                debug!(visitor_id = %visitor_id, error = %e, "Socket read failed");
                break;
            }
            None => break,
        };
        match conn.handle_text(text.as_str()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close { code, reason }) => {
                closing = sink.close(code, &reason).await.is_ok();
                break;
            }
            Err(e) => {
                warn!(visitor_id = %visitor_id, error = %e, "Inbound frame rejected");
            }
        }
    }

    liveness.abort();
    conn.shutdown().await;
    if !closing || tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}
