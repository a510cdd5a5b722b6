//! Tokio driver for the reconnection controller.
//!
//! Owns the WebSocket to the relay, performs the client half of the
//! authenticate / key-exchange handshake, runs the timers the controller asks
//! for, and surfaces relay frames as [`ClientEvent`]s.

use std::collections::HashMap;

use clawtime_crypto::{CryptoError, CryptoSession, FrameError, KeyExchangeState, open_frame};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::reconnect::{Command, ConnState, Event, ReconnectController, ReconnectPolicy, Status, TimerKind};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code the relay uses for rejected credentials.
const CLOSE_AUTH_FAILED: u16 = 4001;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Key exchange failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    Closed,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Relay WebSocket URL, e.g. `ws://127.0.0.1:3000/ws`.
    pub url: String,
    /// Session token issued by the relay's login flow.
    pub token: String,
    /// `Origin` header; derived from `url` when unset.
    pub origin: Option<String>,
    pub policy: ReconnectPolicy,
}

/// What the runner reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Status(Status),
    Chat {
        state: String,
        run_id: String,
        text: Option<String>,
        error: Option<String>,
    },
    AuthFailed(String),
    /// Any other relay frame, decoded.
    Frame(Value),
}

/// `http(s)://authority` for a `ws(s)://` URL.
pub fn origin_for(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let scheme = match scheme {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };
    let authority = rest.split('/').next().filter(|a| !a.is_empty())?;
    Some(format!("{scheme}://{authority}"))
}

struct Link {
    socket: Socket,
    session: CryptoSession,
}

impl Link {
    async fn send(&mut self, frame: &Value) -> Result<(), ConnectionError> {
        let envelope = self.session.encrypt(&frame.to_string())?.to_json()?;
        self.socket
            .send(Message::Text(envelope.into()))
            .await
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))
    }
}

async fn send_plain(socket: &mut Socket, frame: &Value) -> Result<(), ConnectionError> {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))
}

/// Next text frame, decrypted when `session` is set and the frame is an envelope.
async fn read_frame(
    socket: &mut Socket,
    session: Option<&CryptoSession>,
) -> Result<Value, ConnectionError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                let opened = open_frame(session, text.as_str(), false)?;
                return serde_json::from_str(&opened.text)
                    .map_err(|e| ConnectionError::Handshake(e.to_string()));
            }
            Some(Ok(Message::Close(frame))) => {
                if let Some(frame) = frame
                    && u16::from(frame.code) == CLOSE_AUTH_FAILED
                {
                    return Err(ConnectionError::AuthRejected(frame.reason.to_string()));
                }
                return Err(ConnectionError::Closed);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectionError::ConnectFailed(e.to_string())),
            None => return Err(ConnectionError::Closed),
        }
    }
}

fn frame_type(frame: &Value) -> &str {
    frame.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn text_field(frame: &Value, key: &str) -> Option<String> {
    frame.get(key).and_then(Value::as_str).map(String::from)
}

pub struct ClientRunner {
    config: RunnerConfig,
    controller: ReconnectController,
    events: mpsc::Sender<ClientEvent>,
    link: Option<Link>,
    timers: HashMap<TimerKind, Instant>,
}

impl ClientRunner {
    pub fn new(config: RunnerConfig, events: mpsc::Sender<ClientEvent>) -> Self {
        let controller = ReconnectController::new(config.policy.clone());
        Self {
            config,
            controller,
            events,
            link: None,
            timers: HashMap::new(),
        }
    }

    /// Connect and keep reconnecting until `input` closes. Each line received
    /// on `input` is sent as a chat message.
    pub async fn run(mut self, mut input: mpsc::Receiver<String>) {
        let policy = self.controller.policy().clone();
        let mut heartbeat = tokio::time::interval(policy.heartbeat_interval);
        heartbeat.tick().await; // Skip first immediate tick
        let mut watchdog = tokio::time::interval(policy.watchdog_interval);
        watchdog.tick().await; // Skip first immediate tick
        let mut last_beat = Instant::now();

        self.controller.push(Event::Open);
        loop {
            let mut commands = self.controller.drain();
            while !commands.is_empty() {
                for command in commands {
                    for event in self.execute(command).await {
                        self.controller.push(event);
                    }
                }
                commands = self.controller.drain();
            }
            if !self.controller.is_wanted() && self.controller.state() == ConnState::Disconnected {
                break;
            }

            let deadline = self.timers.values().min().copied();
            let event = tokio::select! {
                frame = next_message(&mut self.link) => self.on_message(frame).await,
                line = input.recv() => match line {
                    Some(text) => {
                        self.send_chat(&text).await;
                        None
                    }
                    None => Some(Event::Stop),
                },
                () = sleep_until(deadline) => self.expire_timer(),
                _ = heartbeat.tick() => {
                    let now = Instant::now();
                    let gap = now.duration_since(last_beat);
                    last_beat = now;
                    Some(Event::HeartbeatSample { gap })
                }
                _ = watchdog.tick() => Some(Event::WatchdogTick),
            };
            if let Some(event) = event {
                self.controller.push(event);
            }
        }
        info!("Client runner stopped");
    }

    async fn notify(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Client event receiver gone");
        }
    }

    async fn execute(&mut self, command: Command) -> Vec<Event> {
        match command {
            Command::OpenSocket => {
                let timeout = self.controller.policy().connect_timeout;
                match tokio::time::timeout(timeout, self.open()).await {
                    Ok(Ok(link)) => {
                        self.link = Some(link);
                        return vec![Event::Connected];
                    }
                    Ok(Err(ConnectionError::AuthRejected(reason))) => {
                        warn!(reason = %reason, "Relay rejected credentials");
                        self.notify(ClientEvent::AuthFailed(reason)).await;
                        return vec![Event::Stop];
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Connection attempt failed");
                        return vec![Event::Close { clean: false }];
                    }
                    Err(_) => return vec![Event::ConnectTimeout],
                }
            }
            Command::CloseSocket => {
                if let Some(mut link) = self.link.take()
                    && let Err(e) = link.socket.close(None).await
                {
                    debug!(error = %e, "Socket close failed");
                }
            }
            Command::StartTimer { kind, delay } => {
                self.timers.insert(kind, Instant::now() + delay);
            }
            Command::CancelTimer { kind } => {
                self.timers.remove(&kind);
            }
            Command::SendPing => {
                if let Some(link) = &mut self.link
                    && let Err(e) = link.send(&json!({"type": "ping"})).await
                {
                    debug!(error = %e, "Ping failed");
                }
            }
            Command::Notify(status) => self.notify(ClientEvent::Status(status)).await,
        }
        Vec::new()
    }

    /// Open the socket and run the authenticate / key-exchange handshake.
    async fn open(&self) -> Result<Link, ConnectionError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?;
        if let Some(origin) = self
            .config
            .origin
            .clone()
            .or_else(|| origin_for(&self.config.url))
        {
            let value = HeaderValue::from_str(&origin)
                .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?;
            request.headers_mut().insert("Origin", value);
        }

        let (mut socket, _) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;
        debug!(url = %self.config.url, "Socket open, authenticating");

        send_plain(&mut socket, &json!({"type": "auth", "token": self.config.token})).await?;
        let reply = read_frame(&mut socket, None).await?;
        let server_public_key = match frame_type(&reply) {
            "auth-ok" => text_field(&reply, "serverPublicKey")
                .ok_or_else(|| ConnectionError::Handshake("auth-ok without key".into()))?,
            "auth-fail" => {
                return Err(ConnectionError::AuthRejected(
                    text_field(&reply, "reason").unwrap_or_default(),
                ));
            }
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "expected auth-ok, got {other}"
                )));
            }
        };

        let exchange = KeyExchangeState::new();
        let client_public_key = exchange.public_key_base64();
        let session = exchange.complete(&server_public_key)?;
        send_plain(
            &mut socket,
            &json!({"type": "key-exchange", "clientPublicKey": client_public_key}),
        )
        .await?;

        loop {
            let frame = read_frame(&mut socket, Some(&session)).await?;
            if frame_type(&frame) == "encryption-ready" {
                break;
            }
            self.surface(frame).await;
        }
        info!(url = %self.config.url, "Encrypted session established");
        Ok(Link { socket, session })
    }

    async fn on_message(
        &mut self,
        message: Option<Result<Message, tungstenite::Error>>,
    ) -> Option<Event> {
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                self.link = None;
                let code = frame.as_ref().map(|f| u16::from(f.code));
                if code == Some(CLOSE_AUTH_FAILED) {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    self.notify(ClientEvent::AuthFailed(reason)).await;
                    return Some(Event::Stop);
                }
                debug!(?code, "Relay closed connection");
                return Some(Event::Close {
                    clean: code == Some(u16::from(CloseCode::Normal)),
                });
            }
            Some(Ok(_)) => return None,
            Some(Err(e)) => {
                debug!(error = %e, "Socket read failed");
                self.link = None;
                return Some(Event::Close { clean: false });
            }
            None => {
                self.link = None;
                return Some(Event::Close { clean: false });
            }
        };

        let link = self.link.as_ref()?;
        let frame = match open_frame(Some(&link.session), text.as_str(), true) {
            Ok(opened) => opened.text,
            Err(e) => {
                warn!(error = %e, "Dropping undecryptable frame");
                return None;
            }
        };
        let frame: Value = match serde_json::from_str(&frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return None;
            }
        };
        if frame_type(&frame) == "pong" {
            return Some(Event::Pong);
        }
        self.surface(frame).await;
        None
    }

    async fn surface(&self, frame: Value) {
        let event = if frame_type(&frame) == "chat" {
            ClientEvent::Chat {
                state: text_field(&frame, "state").unwrap_or_default(),
                run_id: text_field(&frame, "runId").unwrap_or_default(),
                text: text_field(&frame, "text"),
                error: text_field(&frame, "error"),
            }
        } else {
            ClientEvent::Frame(frame)
        };
        self.notify(event).await;
    }

    async fn send_chat(&mut self, text: &str) {
        let Some(link) = &mut self.link else {
            warn!("Not connected, message dropped");
            return;
        };
        if let Err(e) = link.send(&json!({"type": "send", "text": text})).await {
            warn!(error = %e, "Failed to send message");
        }
    }

    fn expire_timer(&mut self) -> Option<Event> {
        let now = Instant::now();
        let (kind, _) = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(kind, deadline)| (*kind, *deadline))?;
        self.timers.remove(&kind);
        Some(match kind {
            TimerKind::Connect => Event::ConnectTimeout,
            TimerKind::Backoff => Event::BackoffElapsed,
            TimerKind::Pong => Event::PongTimeout,
        })
    }
}

async fn next_message(link: &mut Option<Link>) -> Option<Result<Message, tungstenite::Error>> {
    match link {
        Some(link) => link.socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
