//! State and message dispatch for one client socket.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clawtime_core::Message;
use clawtime_crypto::{KeyExchangeState, open_frame};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::server::AppState;
use super::sink::ClientSink;
use super::{CLOSE_AUTH_FAILED, CLOSE_RATE_LIMITED, GatewayError};
use crate::auth::AuthError;
use crate::protocol::{AvatarState, ChatState, ClientMessage, ServerMessage};
use crate::speech::{SpeechEntry, SpeechSegmenter};
use crate::stream::{Reassembler, StreamAction};
use crate::upstream::{Attachment, ChatRequest, UpstreamClient, UpstreamEvent, UpstreamHandle};

const UPSTREAM_EVENT_CAPACITY: usize = 256;

/// What the socket loop should do after a frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close { code: u16, reason: String },
}

impl Flow {
    fn close(code: u16, reason: &str) -> Self {
        Self::Close {
            code,
            reason: reason.to_string(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Connection {
    visitor_id: String,
    ip: IpAddr,
    sink: ClientSink,
    state: AppState,
    authenticated: AtomicBool,
    /// Set once the client has sent its first encrypted frame; from then on
    /// plaintext and undecryptable frames are rejected.
    inbound_encrypted: AtomicBool,
    voice_mode: AtomicBool,
    key_exchange: Mutex<Option<KeyExchangeState>>,
    upstream: Mutex<Option<UpstreamHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reassembler: Mutex<Reassembler>,
    segmenter: Mutex<SpeechSegmenter>,
    /// Most recent run that produced speech, target of a bare barge-in.
    speaking_run: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(state: AppState, ip: IpAddr, sink: ClientSink) -> Self {
        let reassembler = Reassembler::new(Arc::clone(&state.history), Arc::clone(&state.runs));
        Self {
            visitor_id: uuid::Uuid::new_v4().to_string(),
            ip,
            sink,
            state,
            authenticated: AtomicBool::new(false),
            inbound_encrypted: AtomicBool::new(false),
            voice_mode: AtomicBool::new(false),
            key_exchange: Mutex::new(None),
            upstream: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            reassembler: Mutex::new(reassembler),
            segmenter: Mutex::new(SpeechSegmenter::new()),
            speaking_run: Mutex::new(None),
        }
    }

    pub fn visitor_id(&self) -> &str {
        &self.visitor_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn voice_mode(&self) -> bool {
        self.voice_mode.load(Ordering::Acquire)
    }

    async fn send(&self, message: &ServerMessage) {
        if let Err(e) = self.sink.send(message).await {
            debug!(visitor_id = %self.visitor_id, error = %e, "Dropped outbound frame");
        }
    }

    /// Decrypt, decode and dispatch one inbound text frame.
    pub async fn handle_text(self: &Arc<Self>, raw: &str) -> Result<Flow, GatewayError> {
        let session = self.sink.crypto();
        let strict = self.inbound_encrypted.load(Ordering::Acquire);
        let opened = open_frame(session.as_deref(), raw, strict)?;
        if opened.decrypted && !strict {
            self.inbound_encrypted.store(true, Ordering::Release);
            debug!(visitor_id = %self.visitor_id, "Inbound encryption established");
        }
        let message: ClientMessage = serde_json::from_str(&opened.text)?;
        self.dispatch(message).await
    }

    pub async fn dispatch(self: &Arc<Self>, message: ClientMessage) -> Result<Flow, GatewayError> {
        if !self.is_authenticated()
            && !matches!(message, ClientMessage::Auth { .. } | ClientMessage::Ping)
        {
            warn!(
                visitor_id = %self.visitor_id,
                kind = message.kind(),
                "Message before authentication ignored"
            );
            return Ok(Flow::Continue);
        }

        match message {
            ClientMessage::Auth { token } => return self.authenticate(&token).await,
            ClientMessage::KeyExchange { client_public_key } => {
                self.complete_key_exchange(&client_public_key).await?;
            }
            ClientMessage::Send { text } => self.forward_chat(text, Vec::new()).await?,
            ClientMessage::Image { data, caption } => {
                self.forward_chat(caption.unwrap_or_default(), vec![data])
                    .await?;
            }
            ClientMessage::GetHistory => {
                let messages = self.state.history.messages();
                self.send(&ServerMessage::History { messages }).await;
            }
            ClientMessage::FetchResource { url } => self.fetch_resource(url),
            ClientMessage::BargeIn { run_id } => self.barge_in(run_id),
            ClientMessage::Ping => self.send(&ServerMessage::Pong).await,
            ClientMessage::VoiceMode { enabled } => self.set_voice_mode(enabled),
            ClientMessage::ReverifyResult {
                request_id,
                verified,
            } => {
                self.state
                    .registry
                    .resolve_reverify(&request_id, verified)
                    .await;
            }
            ClientMessage::Audio { data } => self.transcribe(&data).await,
            ClientMessage::WidgetResponse {
                id,
                widget,
                value,
                action,
            } => {
                let payload = json!({"id": id, "widget": widget, "value": value, "action": action});
                self.relay(ChatRequest::text(format!("[widget-response] {payload}")))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn authenticate(self: &Arc<Self>, token: &str) -> Result<Flow, GatewayError> {
        if self.is_authenticated() {
            debug!(visitor_id = %self.visitor_id, "Duplicate authentication ignored");
            return Ok(Flow::Continue);
        }
        let limiter = &self.state.rate_limiter;
        if limiter.is_blocked(self.ip) {
            warn!(visitor_id = %self.visitor_id, ip = %self.ip, "Authentication rate limited");
            self.sink
                .send_plain(&ServerMessage::AuthFail {
                    reason: AuthError::RateLimited.to_string(),
                })
                .await?;
            return Ok(Flow::close(CLOSE_RATE_LIMITED, "too many failed attempts"));
        }

        if let Err(e) = self.state.validator.validate(token, self.ip) {
            let blocked = limiter.record_failure(self.ip);
            warn!(
                visitor_id = %self.visitor_id,
                ip = %self.ip,
                error = %e,
                blocked,
                "Authentication failed"
            );
            self.sink
                .send_plain(&ServerMessage::AuthFail {
                    reason: e.to_string(),
                })
                .await?;
            return Ok(Flow::close(CLOSE_AUTH_FAILED, "authentication failed"));
        }
        limiter.clear(self.ip);

        self.authenticated.store(true, Ordering::Release);
        self.state
            .registry
            .register(&self.visitor_id, self.sink.clone())
            .await;

        let exchange = KeyExchangeState::new();
        let server_public_key = exchange.public_key_base64();
        *lock(&self.key_exchange) = Some(exchange);
        self.sink
            .send_plain(&ServerMessage::AuthOk { server_public_key })
            .await?;
        info!(visitor_id = %self.visitor_id, ip = %self.ip, "Client authenticated");

        self.start_upstream();
        Ok(Flow::Continue)
    }

    async fn complete_key_exchange(&self, client_public_key: &str) -> Result<(), GatewayError> {
        let Some(exchange) = lock(&self.key_exchange).take() else {
            return Err(GatewayError::NoKeyExchange);
        };
        let session = exchange.complete(client_public_key)?;
        self.sink.enable_encryption(Arc::new(session));
        self.sink.send_plain(&ServerMessage::EncryptionReady).await?;
        info!(visitor_id = %self.visitor_id, "Encryption established");
        Ok(())
    }

    fn start_upstream(self: &Arc<Self>) {
        let (events_tx, mut events_rx) = mpsc::channel(UPSTREAM_EVENT_CAPACITY);
        let client = UpstreamClient::new(
            self.state.config.agent.clone(),
            self.visitor_id.clone(),
            Arc::clone(&self.state.runs),
            events_tx,
        );
        let (handle, relay) = client.spawn();
        *lock(&self.upstream) = Some(handle);

        let conn = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                conn.handle_upstream_event(event).await;
            }
        });
        lock(&self.tasks).extend([relay, pump]);
    }

    async fn forward_chat(&self, text: String, images: Vec<String>) -> Result<(), GatewayError> {
        if let Err(e) = self
            .state
            .history
            .append(Message::user(text.clone(), images.clone()))
        {
            warn!(visitor_id = %self.visitor_id, error = %e, "Failed to store user message");
        }
        let attachments = images
            .iter()
            .filter_map(|image| Attachment::from_data_url(image))
            .collect();
        self.relay(ChatRequest { text, attachments }).await
    }

    async fn relay(&self, request: ChatRequest) -> Result<(), GatewayError> {
        let handle = lock(&self.upstream).clone();
        let Some(handle) = handle else {
            warn!(visitor_id = %self.visitor_id, "No agent relay for message");
            self.send(&ServerMessage::Disconnected {
                reason: Some("agent relay not connected".to_string()),
            })
            .await;
            return Ok(());
        };
        handle.send(request).await?;
        self.send(&ServerMessage::AvatarState {
            state: AvatarState::Thinking,
        })
        .await;
        Ok(())
    }

    fn fetch_resource(&self, url: String) {
        let resources = Arc::clone(&self.state.resources);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let message = resources.fetch_message(&url).await;
            if let Err(e) = sink.send(&message).await {
                debug!(url = %url, error = %e, "Resource fetched after client left");
            }
        });
    }

    fn barge_in(&self, run_id: Option<String>) {
        let Some(run_id) = run_id.or_else(|| lock(&self.speaking_run).clone()) else {
            debug!(visitor_id = %self.visitor_id, "Barge-in with nothing speaking");
            return;
        };
        lock(&self.segmenter).barge_in(&run_id);
        let dropped = self
            .state
            .speech
            .as_ref()
            .map_or(0, |queue| queue.cancel_run(&self.visitor_id, &run_id));
        info!(visitor_id = %self.visitor_id, run_id = %run_id, dropped, "Barge-in");
    }

    fn set_voice_mode(&self, enabled: bool) {
        self.voice_mode.store(enabled, Ordering::Release);
        if !enabled && let Some(queue) = &self.state.speech {
            queue.clear_visitor(&self.visitor_id);
        }
        debug!(visitor_id = %self.visitor_id, enabled, "Voice mode changed");
    }

    async fn transcribe(&self, data: &str) {
        let Some(transcriber) = self.state.transcriber.clone() else {
            self.send(&ServerMessage::TranscriptionError {
                error: "speech recognition is not configured".to_string(),
            })
            .await;
            return;
        };
        let encoded = data.split_once(',').map_or(data, |(_, body)| body);
        let audio = match BASE64.decode(encoded.trim()) {
            Ok(audio) => audio,
            Err(e) => {
                self.send(&ServerMessage::TranscriptionError {
                    error: format!("invalid audio payload: {e}"),
                })
                .await;
                return;
            }
        };
        let sink = self.sink.clone();
        let visitor_id = self.visitor_id.clone();
        tokio::spawn(async move {
            let message = match transcriber.transcribe(&audio).await {
                Ok(text) => ServerMessage::Transcription { text },
                Err(e) => {
                    warn!(visitor_id = %visitor_id, error = %e, "Transcription failed");
                    ServerMessage::TranscriptionError {
                        error: e.to_string(),
                    }
                }
            };
            if let Err(e) = sink.send(&message).await {
                debug!(visitor_id = %visitor_id, error = %e, "Transcript dropped");
            }
        });
    }

    /// React to something the upstream relay reported.
    pub async fn handle_upstream_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Ready => {
                self.send(&ServerMessage::Connected {
                    avatar_state: AvatarState::Idle,
                })
                .await;
            }
            UpstreamEvent::Chat(event) => {
                let actions = lock(&self.reassembler).apply(&event);
                for action in actions {
                    self.perform(action).await;
                }
            }
            UpstreamEvent::SendFailed { run_id, error } => {
                self.send(&ServerMessage::Chat {
                    state: ChatState::Error,
                    run_id,
                    text: None,
                    error: Some(error),
                    images: Vec::new(),
                })
                .await;
                self.send(&ServerMessage::AvatarState {
                    state: AvatarState::Idle,
                })
                .await;
            }
            UpstreamEvent::Closed { reason } => {
                lock(&self.upstream).take();
                info!(visitor_id = %self.visitor_id, reason = %reason, "Agent relay closed");
                self.send(&ServerMessage::Disconnected {
                    reason: Some(reason),
                })
                .await;
            }
        }
    }

    async fn perform(&self, action: StreamAction) {
        match action {
            StreamAction::Send(message) => self.send(&message).await,
            StreamAction::SpeechDelta { run_id, text } => {
                if self.voice_mode() {
                    let units = lock(&self.segmenter).on_delta(&run_id, &text);
                    self.speak(&run_id, units);
                }
            }
            StreamAction::SpeechFinal { run_id, text } => {
                if self.voice_mode() {
                    let units = lock(&self.segmenter).on_final(&run_id, &text);
                    self.speak(&run_id, units);
                } else {
                    lock(&self.segmenter).forget(&run_id);
                }
            }
            StreamAction::SpeechCancel { run_id } => {
                lock(&self.segmenter).forget(&run_id);
                if let Some(queue) = &self.state.speech {
                    queue.cancel_run(&self.visitor_id, &run_id);
                }
            }
        }
    }

    fn speak(&self, run_id: &str, units: Vec<String>) {
        let Some(queue) = &self.state.speech else {
            return;
        };
        if units.is_empty() {
            return;
        }
        *lock(&self.speaking_run) = Some(run_id.to_string());
        for text in units {
            queue.enqueue(
                &self.visitor_id,
                SpeechEntry {
                    run_id: run_id.to_string(),
                    text,
                    sink: self.sink.clone(),
                },
            );
        }
    }

    /// Release everything owned by this connection once its socket closed.
    pub async fn shutdown(&self) {
        self.state.registry.unregister(&self.visitor_id).await;
        let released = self.state.runs.release_visitor(&self.visitor_id);
        if let Some(queue) = &self.state.speech {
            queue.clear_visitor(&self.visitor_id);
        }
        lock(&self.upstream).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!(visitor_id = %self.visitor_id, released, "Client disconnected");
    }
}
