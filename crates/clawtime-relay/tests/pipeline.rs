#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the reply pipeline.
//!
//! Drives run tracking → reassembly → history → speech segmentation and the
//! speech queue together, the way a client connection does, without an agent
//! or a browser on either end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tokio::sync::mpsc;

use clawtime_core::{HistoryStore, Role, now_millis};
use clawtime_relay::gateway::{ClientSink, Outbound};
use clawtime_relay::protocol::{ChatState, ServerMessage};
use clawtime_relay::runs::RunTracker;
use clawtime_relay::speech::{
    SpeechEntry, SpeechError, SpeechQueue, SpeechSegmenter, Synthesizer,
};
use clawtime_relay::stream::{Reassembler, StreamAction};
use clawtime_relay::upstream::ChatEvent;

fn event(run_id: &str, state: &str, text: &str) -> ChatEvent {
    serde_json::from_value(json!({
        "runId": run_id,
        "sessionKey": "main",
        "state": state,
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
    }))
    .unwrap()
}

fn chat_events(actions: &[StreamAction]) -> Vec<(ChatState, Option<String>)> {
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

/// Records the order sentences are synthesized in.
#[derive(Default)]
struct RecordingSynth {
    spoken: Mutex<Vec<String>>,
}

impl Synthesizer for RecordingSynth {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SpeechError>> {
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(text.as_bytes().to_vec())
        }
        .boxed()
    }
}

// =========================================================================
// Reassembly against the persisted stores
// =========================================================================

#[test]
fn streamed_reply_becomes_one_immutable_message() {
    let dir = tempfile::tempdir().unwrap();
    let runs_path = dir.path().join("run-ids.json");
    let history_path = dir.path().join("messages.json");

    let runs = Arc::new(RunTracker::load(&runs_path));
    let history = Arc::new(HistoryStore::open(&history_path).unwrap());
    runs.track("visitor-1", "run-1").unwrap();
    let on_disk: HashMap<String, i64> =
        serde_json::from_str(&std::fs::read_to_string(&runs_path).unwrap()).unwrap();
    assert!(on_disk.contains_key("run-1"));

    let mut reassembler = Reassembler::new(Arc::clone(&history), Arc::clone(&runs));
    let mut actions = Vec::new();
    for (state, text) in [("delta", "He"), ("delta", "Hello"), ("final", "Hello!")] {
        assert!(runs.is_tracked("visitor-1", "run-1"));
        actions.extend(reassembler.apply(&event("run-1", state, text)));
    }

    assert_eq!(
        chat_events(&actions),
        vec![
            (ChatState::Delta, Some("He".into())),
            (ChatState::Delta, Some("Hello".into())),
            (ChatState::Final, Some("Hello!".into())),
        ]
    );

    let stored = HistoryStore::open(&history_path).unwrap().messages();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].role, Role::Bot);
    assert_eq!(stored[0].text, "Hello!");
    assert!(!stored[0].streaming);
    assert!(stored[0].run_id.is_none());

    // A late duplicate final changes nothing.
    assert!(reassembler.apply(&event("run-1", "final", "Hello!")).is_empty());
    assert_eq!(history.messages().len(), 1);

    let on_disk: HashMap<String, i64> =
        serde_json::from_str(&std::fs::read_to_string(&runs_path).unwrap()).unwrap();
    assert!(on_disk.is_empty());
}

#[test]
fn restart_restores_recent_runs_for_a_new_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-ids.json");
    let now = now_millis();
    std::fs::write(
        &path,
        json!({"fresh": now - 30_000, "stale": now - 3 * 60_000}).to_string(),
    )
    .unwrap();

    let runs = Arc::new(RunTracker::load(&path));
    assert_eq!(runs.len(), 1);
    let on_disk: HashMap<String, i64> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(!on_disk.contains_key("stale"));

    // The reconnecting client claims the restored run and finishes it.
    assert!(runs.is_tracked("reconnected", "fresh"));
    assert!(!runs.is_tracked("someone-else", "fresh"));
    assert!(!runs.is_tracked("reconnected", "stale"));

    let history = Arc::new(HistoryStore::in_memory());
    let mut reassembler = Reassembler::new(Arc::clone(&history), Arc::clone(&runs));
    reassembler.apply(&event("fresh", "final", "Recovered reply."));
    assert_eq!(history.messages()[0].text, "Recovered reply.");
    assert!(runs.is_empty());
}

#[test]
fn silent_replies_leave_no_trace() {
    let runs = Arc::new(RunTracker::in_memory());
    let history = Arc::new(HistoryStore::in_memory());
    runs.track("v", "quiet").unwrap();
    let mut reassembler = Reassembler::new(Arc::clone(&history), Arc::clone(&runs));

    let mut actions = Vec::new();
    for (state, text) in [("delta", "NO_"), ("delta", "NO_REPLY"), ("final", "NO_REPLY")] {
        actions.extend(reassembler.apply(&event("quiet", state, text)));
    }
    assert!(chat_events(&actions).is_empty());
    assert!(
        actions
            .iter()
            .all(|a| matches!(a, StreamAction::SpeechCancel { .. }))
    );
    assert!(history.messages().is_empty());
    assert!(!runs.is_tracked("v", "quiet"));
}

// =========================================================================
// Speech segmentation and the per-visitor queue
// =========================================================================

#[tokio::test]
async fn reply_is_spoken_sentence_by_sentence_in_order() {
    let runs = Arc::new(RunTracker::in_memory());
    let history = Arc::new(HistoryStore::in_memory());
    runs.track("v", "r1").unwrap();
    let mut reassembler = Reassembler::new(history, Arc::clone(&runs));
    let mut segmenter = SpeechSegmenter::new();

    let synth = Arc::new(RecordingSynth::default());
    let queue = Arc::new(SpeechQueue::new(Arc::clone(&synth) as Arc<dyn Synthesizer>));
    let (sink, mut rx) = ClientSink::channel(32);

    let events = [
        event("r1", "delta", "Hello world! Tes"),
        event("r1", "delta", "Hello world! Testing"),
        event("r1", "final", "Hello world! Testing complete."),
    ];
    for chat in &events {
        for action in reassembler.apply(chat) {
            let (run_id, units) = match action {
                StreamAction::SpeechDelta { run_id, text } => {
                    let units = segmenter.on_delta(&run_id, &text);
                    (run_id, units)
                }
                StreamAction::SpeechFinal { run_id, text } => {
                    let units = segmenter.on_final(&run_id, &text);
                    (run_id, units)
                }
                _ => continue,
            };
            for text in units {
                queue.enqueue(
                    "v",
                    SpeechEntry {
                        run_id: run_id.clone(),
                        text,
                        sink: sink.clone(),
                    },
                );
            }
        }
    }

    let mut audio = Vec::new();
    while audio.len() < 2 {
        let outbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outbound::Text(raw) = outbound else {
            panic!("unexpected control frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "speech-audio");
        assert_eq!(frame["runId"], "r1");
        let bytes = BASE64.decode(frame["audioData"].as_str().unwrap()).unwrap();
        audio.push(String::from_utf8(bytes).unwrap());
    }
    assert_eq!(audio, vec!["Hello world!", "Testing complete."]);
    assert_eq!(
        *synth.spoken.lock().unwrap(),
        vec!["Hello world!".to_string(), "Testing complete.".to_string()]
    );
}

#[tokio::test]
async fn barge_in_silences_the_rest_of_a_run() {
    let synth = Arc::new(RecordingSynth::default());
    let queue = Arc::new(SpeechQueue::new(Arc::clone(&synth) as Arc<dyn Synthesizer>));
    let (sink, mut rx) = mpsc::channel(32);
    let sink = ClientSink::new(sink);
    let mut segmenter = SpeechSegmenter::new();

    for text in segmenter.on_delta("r1", "One sentence. Two sentence. Three") {
        queue.enqueue(
            "v",
            SpeechEntry {
                run_id: "r1".into(),
                text,
                sink: sink.clone(),
            },
        );
    }
    segmenter.barge_in("r1");
    queue.cancel_run("v", "r1");

    assert!(segmenter.on_final("r1", "One sentence. Two sentence. Three more.").is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.pending("v"), 0);
    // At most the sentence already in flight was synthesized, and none delivered.
    assert!(synth.spoken.lock().unwrap().len() <= 1);
    assert!(rx.try_recv().is_err());
}
