//! Socket loop for one upstream relay connection.

use std::sync::Arc;
use std::time::Duration;

use clawtime_core::config::AgentConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::error::UpstreamError;
use super::protocol::Frame;
use super::state::{ChatRequest, RelayState, Step, UpstreamEvent};
use crate::runs::RunTracker;

/// How often unacknowledged requests are checked for expiry.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Sending side of a running relay.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    tx: mpsc::Sender<ChatRequest>,
}

impl UpstreamHandle {
    pub async fn send(&self, request: ChatRequest) -> Result<(), UpstreamError> {
        self.tx.send(request).await.map_err(|_| UpstreamError::Closed)
    }
}

pub struct UpstreamClient {
    config: AgentConfig,
    visitor_id: String,
    runs: Arc<RunTracker>,
    events: mpsc::Sender<UpstreamEvent>,
}

impl UpstreamClient {
    pub fn new(
        config: AgentConfig,
        visitor_id: impl Into<String>,
        runs: Arc<RunTracker>,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Self {
        Self {
            config,
            visitor_id: visitor_id.into(),
            runs,
            events,
        }
    }

    /// Start the relay. It runs until the agent closes, an error occurs, or
    /// every [`UpstreamHandle`] is dropped, and always ends by reporting
    /// [`UpstreamEvent::Closed`].
    pub fn spawn(self) -> (UpstreamHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(rx));
        (UpstreamHandle { tx }, task)
    }

    async fn run(self, requests: mpsc::Receiver<ChatRequest>) {
        let reason = match self.connect_and_run(requests).await {
            Ok(()) => "agent connection closed".to_string(),
            Err(e) => {
                warn!(visitor_id = %self.visitor_id, error = %e, "Agent relay failed");
                e.to_string()
            }
        };
        if self
            .events
            .send(UpstreamEvent::Closed { reason })
            .await
            .is_err()
        {
            debug!(visitor_id = %self.visitor_id, "Client gone before relay closed");
        }
    }

    async fn connect_and_run(
        &self,
        mut requests: mpsc::Receiver<ChatRequest>,
    ) -> Result<(), UpstreamError> {
        info!(visitor_id = %self.visitor_id, url = %self.config.url, "Connecting to agent");
        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let mut state = RelayState::new(
            self.config.clone(),
            self.visitor_id.clone(),
            Arc::clone(&self.runs),
        );
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.tick().await; // Skip first immediate tick

        loop {
            let step = tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => state.on_frame(text.as_str())?,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(visitor_id = %self.visitor_id, ?frame, "Agent closed connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(UpstreamError::Transport(e.to_string())),
                    None => return Ok(()),
                },
                request = requests.recv() => match request {
                    Some(request) => state.on_request(request),
                    None => {
                        debug!(visitor_id = %self.visitor_id, "Client closed, shutting relay");
                        if let Err(e) = write.close().await {
                            debug!(error = %e, "Agent close handshake failed");
                        }
                        return Ok(());
                    }
                },
                _ = sweep.tick() => state.on_tick()?,
            };
            self.apply(step, &mut write).await?;
        }
    }

    async fn apply<S>(&self, step: Step, write: &mut S) -> Result<(), UpstreamError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        for frame in step.outbound {
            write_frame(write, &frame).await?;
        }
        for event in step.events {
            if self.events.send(event).await.is_err() {
                return Err(UpstreamError::Closed);
            }
        }
        Ok(())
    }
}

async fn write_frame<S>(write: &mut S, frame: &Frame) -> Result<(), UpstreamError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|e| UpstreamError::Transport(e.to_string()))?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))
}
