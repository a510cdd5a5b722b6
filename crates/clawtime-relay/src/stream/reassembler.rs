//! Streaming reassembler.
//!
//! Every agent event carries the full text produced so far, not a suffix, so
//! reassembly is a matter of deciding which full text wins. Per run id the
//! lifecycle is none -> streaming -> finalized (or suppressed on
//! error/abort), and terminal runs ignore everything that follows.
//!
//! Regression rules:
//! - a delta replaces the stored text unless it is more than
//!   [`REGRESSION_SLACK`] characters shorter;
//! - a final shorter than half the stored text keeps the stored text, but the
//!   run is finalized regardless;
//! - a silent final (`NO_REPLY`) after visible deltas finalizes the stored text.

use std::collections::VecDeque;
use std::sync::Arc;

use clawtime_core::{HistoryStore, Message, Role, now_millis};
use tracing::{debug, warn};

use crate::protocol::{AvatarState, ChatState, ServerMessage};
use crate::runs::RunTracker;
use crate::upstream::protocol::ChatEvent;

/// Agent replies that mean "nothing to say".
pub const SILENT_REPLIES: [&str; 2] = ["NO_REPLY", "HEARTBEAT_OK"];

/// How many characters a delta may shrink by and still be accepted.
pub const REGRESSION_SLACK: usize = 10;

/// Terminal run ids remembered per connection.
const TERMINATED_CAPACITY: usize = 128;

pub fn is_silent_reply(text: &str) -> bool {
    SILENT_REPLIES.contains(&text.trim())
}

/// A partial delta that may still grow into a silent reply.
fn may_become_silent(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty() && SILENT_REPLIES.iter().any(|s| s.starts_with(text))
}

/// Side effects of one event, in the order they must happen.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    Send(ServerMessage),
    /// The visible text of a still-streaming run advanced.
    SpeechDelta { run_id: String, text: String },
    /// The run finished; `text` is the longer of the final and accumulated text.
    SpeechFinal { run_id: String, text: String },
    /// The run ended without a reply; forget any speech progress.
    SpeechCancel { run_id: String },
}

pub struct Reassembler {
    history: Arc<HistoryStore>,
    runs: Arc<RunTracker>,
    terminated: VecDeque<String>,
}

impl Reassembler {
    pub fn new(history: Arc<HistoryStore>, runs: Arc<RunTracker>) -> Self {
        Self {
            history,
            runs,
            terminated: VecDeque::new(),
        }
    }

    pub fn is_terminated(&self, run_id: &str) -> bool {
        self.terminated.iter().any(|r| r == run_id)
    }

    fn terminate(&mut self, run_id: &str) {
        if let Err(e) = self.runs.untrack(run_id) {
            warn!(run_id, error = %e, "Failed to untrack run");
        }
        if self.terminated.len() >= TERMINATED_CAPACITY {
            self.terminated.pop_front();
        }
        self.terminated.push_back(run_id.to_string());
    }

    /// Apply one chat event and return what should happen because of it.
    pub fn apply(&mut self, event: &ChatEvent) -> Vec<StreamAction> {
        if self.is_terminated(&event.run_id) {
            debug!(run_id = %event.run_id, state = ?event.state, "Event for finished run ignored");
            return Vec::new();
        }
        match event.state {
            ChatState::Delta => self.delta(event),
            ChatState::Final => self.finish(event),
            ChatState::Error | ChatState::Aborted => self.abort(event),
        }
    }

    fn delta(&self, event: &ChatEvent) -> Vec<StreamAction> {
        let run_id = event.run_id.as_str();
        let text = event.text();
        let mut actions = Vec::new();
        if event.has_tool_use() {
            actions.push(StreamAction::Send(ServerMessage::AvatarState {
                state: AvatarState::Working,
            }));
        }
        if is_silent_reply(&text) || may_become_silent(&text) {
            return actions;
        }

        let images = event.images();
        if text.trim().is_empty() && images.is_empty() {
            return actions;
        }

        let visible = match self.history.find_streaming(run_id) {
            None => {
                let mut message = Message::streaming_bot(run_id, text.clone());
                message.images.clone_from(&images);
                if let Err(e) = self.history.append(message) {
                    warn!(run_id, error = %e, "Failed to store streaming message");
                }
                text
            }
            Some(stored) => {
                let new_len = text.chars().count();
                let stored_len = stored.text.chars().count();
                if new_len + REGRESSION_SLACK < stored_len {
                    debug!(run_id, new_len, stored_len, "Regressed delta ignored");
                    return actions;
                }
                let update = self.history.update(&stored.id, |m| {
                    m.text.clone_from(&text);
                    if !images.is_empty() {
                        m.images.clone_from(&images);
                    }
                });
                if let Err(e) = update {
                    warn!(run_id, error = %e, "Failed to update streaming message");
                }
                text
            }
        };

        actions.push(StreamAction::Send(ServerMessage::Chat {
            state: ChatState::Delta,
            run_id: run_id.to_string(),
            text: Some(visible.clone()),
            error: None,
            images,
        }));
        actions.push(StreamAction::SpeechDelta {
            run_id: run_id.to_string(),
            text: visible,
        });
        actions
    }

    fn finish(&mut self, event: &ChatEvent) -> Vec<StreamAction> {
        let run_id = event.run_id.as_str();
        let stored = self.history.find_streaming(run_id);
        let text = match (&stored, event.text()) {
            // A sentinel never replaces text the client has already seen.
            (Some(stored), text) if is_silent_reply(&text) => stored.text.clone(),
            (None, text) if is_silent_reply(&text) => {
                self.terminate(run_id);
                return vec![StreamAction::SpeechCancel {
                    run_id: run_id.to_string(),
                }];
            }
            (_, text) => text,
        };

        let event_images = event.images();
        let (visible, images) = match &stored {
            Some(stored) => {
                let new_len = text.chars().count();
                let stored_len = stored.text.chars().count();
                let visible = if new_len * 2 < stored_len {
                    debug!(run_id, new_len, stored_len, "Truncated final, keeping stored text");
                    stored.text.clone()
                } else {
                    text
                };
                let images = if event_images.is_empty() {
                    stored.images.clone()
                } else {
                    event_images
                };
                (visible, images)
            }
            None => (text, event_images),
        };

        let written = match &stored {
            Some(stored) => self
                .history
                .update(&stored.id, |m| {
                    m.text.clone_from(&visible);
                    m.images.clone_from(&images);
                    m.streaming = false;
                    m.run_id = None;
                })
                .map(|_| ()),
            None if !visible.trim().is_empty() || !images.is_empty() => {
                self.history.append(Message {
                    id: uuid::Uuid::new_v4().to_string(),
                    role: Role::Bot,
                    text: visible.clone(),
                    images: images.clone(),
                    widget: None,
                    timestamp: now_millis(),
                    run_id: None,
                    streaming: false,
                })
            }
            None => Ok(()),
        };
        if let Err(e) = written {
            warn!(run_id, error = %e, "Failed to store final message");
        }
        self.terminate(run_id);

        let spoken = match stored {
            Some(stored) if stored.text.chars().count() > visible.chars().count() => stored.text,
            _ => visible.clone(),
        };

        vec![
            StreamAction::Send(ServerMessage::Chat {
                state: ChatState::Final,
                run_id: run_id.to_string(),
                text: Some(visible),
                error: None,
                images,
            }),
            StreamAction::Send(ServerMessage::AvatarState {
                state: AvatarState::Idle,
            }),
            StreamAction::SpeechFinal {
                run_id: run_id.to_string(),
                text: spoken,
            },
        ]
    }

    fn abort(&mut self, event: &ChatEvent) -> Vec<StreamAction> {
        let run_id = event.run_id.as_str();
        if let Some(stored) = self.history.find_streaming(run_id) {
            self.remove_message(run_id, &stored.id);
        }
        self.terminate(run_id);

        let error = event.error_message.clone().unwrap_or_else(|| {
            if event.state == ChatState::Aborted {
                "Request aborted".to_string()
            } else {
                "Request failed".to_string()
            }
        });
        debug!(run_id, state = ?event.state, error = %error, "Run ended without reply");

        vec![
            StreamAction::Send(ServerMessage::Chat {
                state: event.state,
                run_id: run_id.to_string(),
                text: None,
                error: Some(error),
                images: Vec::new(),
            }),
            StreamAction::Send(ServerMessage::AvatarState {
                state: AvatarState::Idle,
            }),
            StreamAction::SpeechCancel {
                run_id: run_id.to_string(),
            },
        ]
    }

    fn remove_message(&self, run_id: &str, id: &str) {
        if let Err(e) = self.history.remove(id) {
            warn!(run_id, error = %e, "Failed to drop streaming message");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(run_id: &str, state: &str, text: &str) -> ChatEvent {
        serde_json::from_value(json!({
            "runId": run_id,
            "sessionKey": "main",
            "state": state,
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
        }))
        .unwrap()
    }

    fn setup() -> (Reassembler, Arc<HistoryStore>, Arc<RunTracker>) {
        let history = Arc::new(HistoryStore::in_memory());
        let runs = Arc::new(RunTracker::in_memory());
        runs.track("v1", "r1").unwrap();
        (
            Reassembler::new(Arc::clone(&history), Arc::clone(&runs)),
            history,
            runs,
        )
    }

    fn chat_texts(actions: &[StreamAction]) -> Vec<(ChatState, Option<String>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                StreamAction::Send(ServerMessage::Chat { state, text, .. }) => {
                    Some((*state, text.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn deltas_then_final_produce_one_immutable_message() {
        let (mut r, history, runs) = setup();
        let mut seen = Vec::new();
        seen.extend(chat_texts(&r.apply(&event("r1", "delta", "He"))));
        seen.extend(chat_texts(&r.apply(&event("r1", "delta", "Hello"))));
        seen.extend(chat_texts(&r.apply(&event("r1", "final", "Hello!"))));

        assert_eq!(
            seen,
            vec![
                (ChatState::Delta, Some("He".into())),
                (ChatState::Delta, Some("Hello".into())),
                (ChatState::Final, Some("Hello!".into())),
            ]
        );
        let messages = history.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hello!");
        assert!(!messages[0].streaming);
        assert!(messages[0].run_id.is_none());
        assert!(!runs.is_tracked("v1", "r1"));
    }

    #[test]
    fn small_regression_is_accepted_large_is_ignored() {
        let (mut r, history, _) = setup();
        r.apply(&event("r1", "delta", "The quick brown fox jumps"));
        let actions = r.apply(&event("r1", "delta", "The quick brown fox"));
        assert_eq!(chat_texts(&actions).len(), 1, "6 chars shorter is accepted");
        assert_eq!(history.messages()[0].text, "The quick brown fox");

        r.apply(&event("r1", "delta", "The quick brown fox jumps over the lazy dog"));
        let actions = r.apply(&event("r1", "delta", "The quick"));
        assert!(chat_texts(&actions).is_empty());
        assert_eq!(
            history.messages()[0].text,
            "The quick brown fox jumps over the lazy dog"
        );
    }

    #[test]
    fn stored_text_follows_longest_growth_within_slack() {
        let (mut r, history, _) = setup();
        let deltas = ["a", "abc", "abcdefghijklmnop", "abcdefghij", "abcdefghijklmnopqrs"];
        for text in deltas {
            r.apply(&event("r1", "delta", text));
        }
        assert_eq!(history.messages()[0].text, "abcdefghijklmnopqrs");
    }

    #[test]
    fn truncated_final_keeps_stored_text_but_finalizes() {
        let (mut r, history, runs) = setup();
        let long = "This reply is long enough to matter for the check.";
        r.apply(&event("r1", "delta", long));
        let actions = r.apply(&event("r1", "final", "This reply"));
        assert_eq!(
            chat_texts(&actions),
            vec![(ChatState::Final, Some(long.to_string()))]
        );
        let messages = history.messages();
        assert_eq!(messages[0].text, long);
        assert!(!messages[0].streaming);
        assert!(!runs.is_tracked("v1", "r1"));
    }

    #[test]
    fn moderately_shorter_final_is_written_as_is() {
        let (mut r, history, _) = setup();
        r.apply(&event("r1", "delta", "Hello there, how are you doing?"));
        r.apply(&event("r1", "final", "Hello there, friend."));
        assert_eq!(history.messages()[0].text, "Hello there, friend.");
    }

    #[test]
    fn duplicate_final_is_a_no_op() {
        let (mut r, history, _) = setup();
        r.apply(&event("r1", "delta", "Hi"));
        r.apply(&event("r1", "final", "Hi there"));
        assert!(r.apply(&event("r1", "final", "Hi there")).is_empty());
        assert!(r.apply(&event("r1", "delta", "Hi there again")).is_empty());
        let messages = history.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hi there");
    }

    #[test]
    fn final_without_deltas_creates_message() {
        let (mut r, history, _) = setup();
        let actions = r.apply(&event("r1", "final", "Done."));
        assert_eq!(chat_texts(&actions), vec![(ChatState::Final, Some("Done.".into()))]);
        assert_eq!(history.messages().len(), 1);
        assert!(!history.messages()[0].streaming);
    }

    #[test]
    fn silent_replies_never_emit() {
        for sentinel in SILENT_REPLIES {
            let (mut r, history, runs) = setup();
            assert!(r.apply(&event("r1", "delta", "NO")).is_empty());
            assert!(r.apply(&event("r1", "delta", sentinel)).is_empty());
            let actions = r.apply(&event("r1", "final", &format!(" {sentinel}\n")));
            assert!(chat_texts(&actions).is_empty());
            assert!(
                actions
                    .iter()
                    .all(|a| !matches!(a, StreamAction::SpeechDelta { .. } | StreamAction::SpeechFinal { .. }))
            );
            assert!(history.messages().is_empty());
            assert!(!runs.is_tracked("v1", "r1"));
        }
    }

    #[test]
    fn silent_final_keeps_streamed_text() {
        let (mut r, history, runs) = setup();
        r.apply(&event("r1", "delta", "Let me check that for you"));
        let actions = r.apply(&event("r1", "final", "NO_REPLY"));

        assert_eq!(
            chat_texts(&actions),
            vec![(ChatState::Final, Some("Let me check that for you".into()))]
        );
        assert!(actions.contains(&StreamAction::Send(ServerMessage::AvatarState {
            state: AvatarState::Idle
        })));
        let messages = history.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Let me check that for you");
        assert!(!messages[0].streaming);
        assert!(!runs.is_tracked("v1", "r1"));
    }

    #[test]
    fn held_back_delta_still_signals_tool_use() {
        let (mut r, history, _) = setup();
        let tool_event: ChatEvent = serde_json::from_value(json!({
            "runId": "r1",
            "state": "delta",
            "message": {"content": [
                {"type": "text", "text": "NO"},
                {"type": "tool_use", "id": "t1", "name": "search", "input": {}}
            ]}
        }))
        .unwrap();
        let actions = r.apply(&tool_event);
        assert_eq!(
            actions,
            vec![StreamAction::Send(ServerMessage::AvatarState {
                state: AvatarState::Working
            })]
        );
        assert!(history.messages().is_empty());

        // The held-back prefix shows up once the text diverges.
        let actions = r.apply(&event("r1", "delta", "NOT much, thanks"));
        assert_eq!(
            chat_texts(&actions),
            vec![(ChatState::Delta, Some("NOT much, thanks".into()))]
        );
    }

    #[test]
    fn tool_use_delta_signals_working() {
        let (mut r, _, _) = setup();
        let event: ChatEvent = serde_json::from_value(json!({
            "runId": "r1",
            "state": "delta",
            "message": {"content": [
                {"type": "text", "text": "Let me check"},
                {"type": "tool_use", "id": "t1", "name": "search", "input": {}}
            ]}
        }))
        .unwrap();
        let actions = r.apply(&event);
        assert_eq!(
            actions[0],
            StreamAction::Send(ServerMessage::AvatarState {
                state: AvatarState::Working
            })
        );
        assert_eq!(
            chat_texts(&actions),
            vec![(ChatState::Delta, Some("Let me check".into()))]
        );
    }

    #[test]
    fn error_emits_notice_and_drops_partial_message() {
        let (mut r, history, runs) = setup();
        r.apply(&event("r1", "delta", "Partial"));
        let error: ChatEvent = serde_json::from_value(json!({
            "runId": "r1", "state": "error", "errorMessage": "model overloaded"
        }))
        .unwrap();
        let actions = r.apply(&error);
        match &actions[0] {
            StreamAction::Send(ServerMessage::Chat { state, error, text, .. }) => {
                assert_eq!(*state, ChatState::Error);
                assert_eq!(error.as_deref(), Some("model overloaded"));
                assert!(text.is_none());
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(history.messages().is_empty());
        assert!(!runs.is_tracked("v1", "r1"));
        assert!(r.apply(&event("r1", "final", "late")).is_empty());
    }

    #[test]
    fn aborted_without_message_uses_default_notice() {
        let (mut r, _, _) = setup();
        let aborted: ChatEvent =
            serde_json::from_value(json!({"runId": "r1", "state": "aborted"})).unwrap();
        let actions = r.apply(&aborted);
        assert!(matches!(
            &actions[0],
            StreamAction::Send(ServerMessage::Chat { state: ChatState::Aborted, error: Some(e), .. })
                if e == "Request aborted"
        ));
    }

    #[test]
    fn images_are_forwarded_and_stored() {
        let (mut r, history, _) = setup();
        let event: ChatEvent = serde_json::from_value(json!({
            "runId": "r1",
            "state": "final",
            "message": {"content": [
                {"type": "text", "text": "Here you go"},
                {"type": "image", "url": "https://example.com/cat.png"}
            ]}
        }))
        .unwrap();
        let actions = r.apply(&event);
        assert!(matches!(
            &actions[0],
            StreamAction::Send(ServerMessage::Chat { images, .. }) if images == &vec!["https://example.com/cat.png".to_string()]
        ));
        assert_eq!(history.messages()[0].images, vec!["https://example.com/cat.png"]);
    }
}
