//! Shared server state and the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clawtime_core::HistoryStore;
use clawtime_core::config::Config;
use tracing::info;

use super::handler::ws_handler;
use crate::auth::{RateLimiter, SessionStore, SessionValidator};
use crate::registry::ClientRegistry;
use crate::resource::{ResourceError, ResourceFetcher};
use crate::runs::RunTracker;
use crate::speech::{CommandSynthesizer, CommandTranscriber, SpeechQueue};

/// Process-wide state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub validator: Arc<SessionValidator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub registry: ClientRegistry,
    pub runs: Arc<RunTracker>,
    pub history: Arc<HistoryStore>,
    /// `None` when no synthesis command is configured.
    pub speech: Option<Arc<SpeechQueue>>,
    pub transcriber: Option<Arc<CommandTranscriber>>,
    pub resources: Arc<ResourceFetcher>,
}

impl AppState {
    pub fn new(
        config: Config,
        sessions: Arc<dyn SessionStore>,
        runs: Arc<RunTracker>,
        history: Arc<HistoryStore>,
    ) -> Result<Self, ResourceError> {
        let auth = &config.auth;
        let validator = SessionValidator::new(sessions, Duration::from_secs(auth.session_ttl_secs));
        let rate_limiter = RateLimiter::new(
            Duration::from_secs(auth.failure_window_secs),
            auth.max_failures,
        );

        let speech_timeout = Duration::from_secs(config.speech.timeout_secs);
        let speech = config.speech.tts_command.as_ref().map(|template| {
            info!("Speech synthesis enabled");
            Arc::new(SpeechQueue::new(Arc::new(CommandSynthesizer::new(
                template.clone(),
                speech_timeout,
            ))))
        });
        let transcriber = config.speech.stt_command.as_ref().map(|template| {
            info!("Speech recognition enabled");
            Arc::new(CommandTranscriber::new(template.clone(), speech_timeout))
        });
        let resources = ResourceFetcher::new(config.server.max_resource_bytes)?;

        Ok(Self {
            config: Arc::new(config),
            validator: Arc::new(validator),
            rate_limiter: Arc::new(rate_limiter),
            registry: ClientRegistry::new(),
            runs,
            history,
            speech,
            transcriber,
            resources: Arc::new(resources),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
