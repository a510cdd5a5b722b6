//! Protocol state of one upstream relay connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clawtime_core::config::AgentConfig;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::error::UpstreamError;
use super::protocol::{
    Attachment, ChatEvent, EVENT_CHALLENGE, EVENT_CHAT, Frame, METHOD_CHAT_SEND, METHOD_CONNECT,
    chat_send_params, connect_params, error_message,
};
use crate::runs::RunTracker;

/// A user message to forward to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl ChatRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// What the relay reports to its client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Ready,
    Chat(ChatEvent),
    /// `run_id` is the idempotency key the send was tracked under.
    SendFailed { run_id: String, error: String },
    Closed { reason: String },
}

/// Frames to write upstream and events to report, in order.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub outbound: Vec<Frame>,
    pub events: Vec<UpstreamEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingChallenge,
    Connecting { request_id: String },
    Ready,
}

#[derive(Debug)]
struct PendingSend {
    idempotency_key: String,
    sent_at: Instant,
}

pub struct RelayState {
    config: AgentConfig,
    visitor_id: String,
    runs: Arc<RunTracker>,
    phase: Phase,
    started_at: Instant,
    buffered: VecDeque<ChatRequest>,
    pending: HashMap<String, PendingSend>,
}

impl RelayState {
    pub fn new(config: AgentConfig, visitor_id: impl Into<String>, runs: Arc<RunTracker>) -> Self {
        Self::new_at(config, visitor_id, runs, Instant::now())
    }

    fn new_at(
        config: AgentConfig,
        visitor_id: impl Into<String>,
        runs: Arc<RunTracker>,
        now: Instant,
    ) -> Self {
        Self {
            config,
            visitor_id: visitor_id.into(),
            runs,
            phase: Phase::AwaitingChallenge,
            started_at: now,
            buffered: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Queue a user message, or send it right away once ready.
    pub fn on_request(&mut self, request: ChatRequest) -> Step {
        self.on_request_at(request, Instant::now())
    }

    fn on_request_at(&mut self, request: ChatRequest, now: Instant) -> Step {
        if !self.is_ready() {
            debug!(visitor_id = %self.visitor_id, "Agent not ready, buffering message");
            self.buffered.push_back(request);
            return Step::default();
        }
        Step {
            outbound: vec![self.chat_send(&request, now)],
            events: Vec::new(),
        }
    }

    fn chat_send(&mut self, request: &ChatRequest, now: Instant) -> Frame {
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        // The agent uses the idempotency key as run id unless it says
        // otherwise; tracking it now keeps early events from being dropped.
        if let Err(e) = self.runs.track(&self.visitor_id, &idempotency_key) {
            warn!(visitor_id = %self.visitor_id, error = %e, "Failed to track run");
        }
        let params = chat_send_params(
            &self.config.session_key,
            &request.text,
            &request.attachments,
            &idempotency_key,
        );
        let (id, frame) = Frame::request(METHOD_CHAT_SEND, params);
        self.pending.insert(
            id,
            PendingSend {
                idempotency_key,
                sent_at: now,
            },
        );
        frame
    }

    /// Handle one raw frame from the agent.
    pub fn on_frame(&mut self, raw: &str) -> Result<Step, UpstreamError> {
        self.on_frame_at(raw, Instant::now())
    }

    fn on_frame_at(&mut self, raw: &str, now: Instant) -> Result<Step, UpstreamError> {
        let frame: Frame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(visitor_id = %self.visitor_id, error = %e, "Malformed agent frame");
                return Ok(Step::default());
            }
        };
        match frame {
            Frame::Event { event, payload } => Ok(self.on_event(&event, payload)),
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } => self.on_response(&id, ok, &payload, &error, now),
            Frame::Req { method, .. } => {
                debug!(method = %method, "Ignoring agent request");
                Ok(Step::default())
            }
        }
    }

    fn on_event(&mut self, event: &str, payload: Value) -> Step {
        match event {
            EVENT_CHALLENGE => {
                if self.phase != Phase::AwaitingChallenge {
                    debug!("Duplicate connect challenge ignored");
                    return Step::default();
                }
                let nonce = payload.get("nonce").and_then(Value::as_str);
                let (request_id, frame) =
                    Frame::request(METHOD_CONNECT, connect_params(&self.config, nonce));
                self.phase = Phase::Connecting { request_id };
                Step {
                    outbound: vec![frame],
                    events: Vec::new(),
                }
            }
            EVENT_CHAT => {
                let chat: ChatEvent = match serde_json::from_value(payload) {
                    Ok(chat) => chat,
                    Err(e) => {
                        warn!(error = %e, "Malformed chat event");
                        return Step::default();
                    }
                };
                if !self.runs.is_tracked(&self.visitor_id, &chat.run_id) {
                    trace!(run_id = %chat.run_id, "Dropping event for untracked run");
                    return Step::default();
                }
                Step {
                    outbound: Vec::new(),
                    events: vec![UpstreamEvent::Chat(chat)],
                }
            }
            other => {
                trace!(event = other, "Ignoring agent event");
                Step::default()
            }
        }
    }

    fn on_response(
        &mut self,
        id: &str,
        ok: bool,
        payload: &Value,
        error: &Value,
        now: Instant,
    ) -> Result<Step, UpstreamError> {
        if matches!(&self.phase, Phase::Connecting { request_id } if request_id == id) {
            if !ok {
                return Err(UpstreamError::Handshake(error_message(error)));
            }
            self.phase = Phase::Ready;
            info!(
                visitor_id = %self.visitor_id,
                buffered = self.buffered.len(),
                "Agent relay ready"
            );
            let buffered: Vec<ChatRequest> = self.buffered.drain(..).collect();
            let outbound = buffered
                .iter()
                .map(|request| self.chat_send(request, now))
                .collect();
            return Ok(Step {
                outbound,
                events: vec![UpstreamEvent::Ready],
            });
        }

        let Some(pending) = self.pending.remove(id) else {
            debug!(id, "Response for unknown request");
            return Ok(Step::default());
        };
        if !ok {
            let error = error_message(error);
            warn!(visitor_id = %self.visitor_id, error = %error, "Agent rejected message");
            self.untrack(&pending.idempotency_key);
            return Ok(Step {
                outbound: Vec::new(),
                events: vec![UpstreamEvent::SendFailed {
                    run_id: pending.idempotency_key,
                    error,
                }],
            });
        }

        match payload.get("runId").and_then(Value::as_str) {
            Some(run_id) if run_id != pending.idempotency_key => {
                if let Err(e) = self.runs.track(&self.visitor_id, run_id) {
                    warn!(run_id, error = %e, "Failed to track run");
                }
                self.untrack(&pending.idempotency_key);
                debug!(run_id, "Message acknowledged");
            }
            Some(run_id) => debug!(run_id, "Message acknowledged"),
            None => debug!(
                run_id = %pending.idempotency_key,
                "Acknowledgement without run id, keeping idempotency key"
            ),
        }
        Ok(Step::default())
    }

    fn untrack(&self, run_id: &str) {
        if let Err(e) = self.runs.untrack(run_id) {
            warn!(run_id, error = %e, "Failed to untrack run");
        }
    }

    /// Expire unacknowledged sends and enforce the handshake deadline.
    pub fn on_tick(&mut self) -> Result<Step, UpstreamError> {
        self.on_tick_at(Instant::now())
    }

    fn on_tick_at(&mut self, now: Instant) -> Result<Step, UpstreamError> {
        let timeout = self.timeout();
        if !self.is_ready() && now.saturating_duration_since(self.started_at) > timeout {
            return Err(UpstreamError::Handshake(format!(
                "agent not ready after {}s",
                timeout.as_secs()
            )));
        }

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let mut step = Step::default();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                warn!(request_id = %id, "Agent did not acknowledge message in time");
                self.untrack(&pending.idempotency_key);
                step.events.push(UpstreamEvent::SendFailed {
                    run_id: pending.idempotency_key,
                    error: "The agent did not acknowledge the message".to_string(),
                });
            }
        }
        Ok(step)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> (RelayState, Arc<RunTracker>) {
        let runs = Arc::new(RunTracker::in_memory());
        let config = AgentConfig {
            token: Some("agent-token".into()),
            ..Default::default()
        };
        (RelayState::new(config, "v1", Arc::clone(&runs)), runs)
    }

    fn req_id(frame: &Frame) -> String {
        match frame {
            Frame::Req { id, .. } => id.clone(),
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn handshake(state: &mut RelayState) -> Step {
        let step = state
            .on_frame(r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n1"}}"#)
            .unwrap();
        let connect_id = req_id(&step.outbound[0]);
        state
            .on_frame(&json!({"type": "res", "id": connect_id, "ok": true}).to_string())
            .unwrap()
    }

    #[test]
    fn challenge_triggers_connect_with_credentials() {
        let (mut state, _) = state();
        let step = state
            .on_frame(r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n1"}}"#)
            .unwrap();
        let Frame::Req { method, params, .. } = &step.outbound[0] else {
            panic!("expected connect request");
        };
        assert_eq!(method, "connect");
        assert_eq!(params["auth"]["token"], "agent-token");
        assert_eq!(params["nonce"], "n1");
        assert!(!state.is_ready());
    }

    #[test]
    fn sends_before_ready_are_buffered_and_flushed_in_order() {
        let (mut state, _) = state();
        assert!(state.on_request(ChatRequest::text("first")).outbound.is_empty());
        assert!(state.on_request(ChatRequest::text("second")).outbound.is_empty());
        assert_eq!(state.buffered(), 2);

        let step = handshake(&mut state);
        assert_eq!(step.events, vec![UpstreamEvent::Ready]);
        let messages: Vec<&str> = step
            .outbound
            .iter()
            .map(|f| match f {
                Frame::Req { params, .. } => params["message"].as_str().unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(state.buffered(), 0);
        assert_eq!(state.pending(), 2);
    }

    #[test]
    fn every_send_has_fresh_ids() {
        let (mut state, _) = state();
        handshake(&mut state);
        let a = state.on_request(ChatRequest::text("a")).outbound.remove(0);
        let b = state.on_request(ChatRequest::text("b")).outbound.remove(0);
        let (Frame::Req { id: id_a, params: pa, .. }, Frame::Req { id: id_b, params: pb, .. }) =
            (a, b)
        else {
            panic!("expected requests");
        };
        assert_ne!(id_a, id_b);
        assert_ne!(pa["idempotencyKey"], pb["idempotencyKey"]);
        assert_eq!(pa["sessionKey"], "main");
    }

    #[test]
    fn acknowledged_run_id_is_tracked() {
        let (mut state, runs) = state();
        handshake(&mut state);
        let frame = state.on_request(ChatRequest::text("hi")).outbound.remove(0);
        let Frame::Req { id, params, .. } = frame else {
            panic!("expected request");
        };
        let key = params["idempotencyKey"].as_str().unwrap().to_string();
        assert!(runs.is_tracked("v1", &key));

        state
            .on_frame(&json!({"type": "res", "id": id, "ok": true, "payload": {"runId": "run-9"}}).to_string())
            .unwrap();
        assert!(runs.is_tracked("v1", "run-9"));
        assert!(!runs.is_tracked("v1", &key));
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn chat_events_are_filtered_by_tracked_run() {
        let (mut state, runs) = state();
        handshake(&mut state);
        runs.track("v1", "mine").unwrap();
        runs.track("v2", "theirs").unwrap();

        let event = |run: &str| {
            json!({"type": "event", "event": "chat", "payload": {
                "runId": run, "sessionKey": "main", "state": "delta",
                "message": {"content": [{"type": "text", "text": "x"}]}
            }})
            .to_string()
        };
        let step = state.on_frame(&event("mine")).unwrap();
        assert!(matches!(&step.events[..], [UpstreamEvent::Chat(e)] if e.run_id == "mine"));
        assert!(state.on_frame(&event("theirs")).unwrap().events.is_empty());
        assert!(state.on_frame(&event("unknown")).unwrap().events.is_empty());
    }

    #[test]
    fn rejected_connect_is_a_handshake_error() {
        let (mut state, _) = state();
        let step = state
            .on_frame(r#"{"type":"event","event":"connect.challenge","payload":{}}"#)
            .unwrap();
        let id = req_id(&step.outbound[0]);
        let result = state.on_frame(
            &json!({"type": "res", "id": id, "ok": false, "error": {"message": "bad token"}})
                .to_string(),
        );
        assert!(matches!(result, Err(UpstreamError::Handshake(m)) if m == "bad token"));
    }

    #[test]
    fn rejected_send_reports_failure() {
        let (mut state, runs) = state();
        handshake(&mut state);
        let Frame::Req { id, params, .. } = state.on_request(ChatRequest::text("hi")).outbound.remove(0)
        else {
            panic!("expected request");
        };
        let step = state
            .on_frame(&json!({"type": "res", "id": id, "ok": false, "error": "busy"}).to_string())
            .unwrap();
        let key = params["idempotencyKey"].as_str().unwrap();
        assert_eq!(
            step.events,
            vec![UpstreamEvent::SendFailed {
                run_id: key.to_string(),
                error: "busy".into()
            }]
        );
        assert!(!runs.is_tracked("v1", key));
    }

    #[test]
    fn unacknowledged_sends_expire() {
        let (mut state, _) = state();
        let start = Instant::now();
        handshake(&mut state);
        state.on_request_at(ChatRequest::text("hi"), start);
        assert!(state.on_tick_at(start + Duration::from_secs(30)).unwrap().events.is_empty());
        let step = state.on_tick_at(start + Duration::from_secs(61)).unwrap();
        assert_eq!(step.events.len(), 1);
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn handshake_deadline() {
        let runs = Arc::new(RunTracker::in_memory());
        let start = Instant::now();
        let mut state = RelayState::new_at(AgentConfig::default(), "v1", runs, start);
        assert!(state.on_tick_at(start + Duration::from_secs(10)).is_ok());
        assert!(matches!(
            state.on_tick_at(start + Duration::from_secs(61)),
            Err(UpstreamError::Handshake(_))
        ));
    }

    #[test]
    fn malformed_and_tick_frames_are_ignored() {
        let (mut state, _) = state();
        assert_eq!(state.on_frame("not json").unwrap(), Step::default());
        assert_eq!(
            state
                .on_frame(r#"{"type":"event","event":"tick","payload":{"ts":1}}"#)
                .unwrap(),
            Step::default()
        );
    }
}
