//! Per-visitor speech synthesis queue.
//!
//! Each visitor has a FIFO of sentences and at most one worker task draining
//! it, so audio for one visitor is produced strictly in enqueue order while
//! different visitors synthesize concurrently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use super::Synthesizer;
use crate::gateway::sink::ClientSink;
use crate::protocol::ServerMessage;

/// One sentence waiting for synthesis.
#[derive(Clone)]
pub struct SpeechEntry {
    pub run_id: String,
    pub text: String,
    pub sink: ClientSink,
}

#[derive(Default)]
struct VisitorQueue {
    pending: VecDeque<SpeechEntry>,
    busy: bool,
    /// Runs barged-in while this visitor's worker was running.
    cancelled: HashSet<String>,
}

pub struct SpeechQueue {
    synthesizer: Arc<dyn Synthesizer>,
    visitors: Mutex<HashMap<String, VisitorQueue>>,
}

impl SpeechQueue {
    pub fn new(synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            synthesizer,
            visitors: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VisitorQueue>> {
        self.visitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a sentence, starting the visitor's worker if it is idle.
    pub fn enqueue(self: &Arc<Self>, visitor_id: &str, entry: SpeechEntry) {
        let start_worker = {
            let mut visitors = self.lock();
            let queue = visitors.entry(visitor_id.to_string()).or_default();
            queue.pending.push_back(entry);
            !std::mem::replace(&mut queue.busy, true)
        };
        if start_worker {
            let queue = Arc::clone(self);
            let visitor_id = visitor_id.to_string();
            tokio::spawn(async move { queue.drain(visitor_id).await });
        }
    }

    /// Drop pending sentences of `run_id` and suppress one in flight.
    pub fn cancel_run(&self, visitor_id: &str, run_id: &str) -> usize {
        let mut visitors = self.lock();
        let Some(queue) = visitors.get_mut(visitor_id) else {
            return 0;
        };
        let before = queue.pending.len();
        queue.pending.retain(|e| e.run_id != run_id);
        if queue.busy {
            queue.cancelled.insert(run_id.to_string());
        }
        before - queue.pending.len()
    }

    /// Forget everything queued for a visitor whose connection closed.
    pub fn clear_visitor(&self, visitor_id: &str) {
        if let Some(queue) = self.lock().get_mut(visitor_id) {
            queue.pending.clear();
        }
    }

    pub fn pending(&self, visitor_id: &str) -> usize {
        self.lock().get(visitor_id).map_or(0, |q| q.pending.len())
    }

    fn next_entry(&self, visitor_id: &str) -> Option<SpeechEntry> {
        let mut visitors = self.lock();
        let queue = visitors.get_mut(visitor_id)?;
        if let Some(entry) = queue.pending.pop_front() {
            return Some(entry);
        }
        visitors.remove(visitor_id);
        None
    }

    fn is_cancelled(&self, visitor_id: &str, run_id: &str) -> bool {
        self.lock()
            .get(visitor_id)
            .is_some_and(|q| q.cancelled.contains(run_id))
    }

    async fn drain(self: Arc<Self>, visitor_id: String) {
        while let Some(entry) = self.next_entry(&visitor_id) {
            if entry.sink.is_closed() {
                debug!(visitor_id = %visitor_id, "Client gone, dropping speech");
                continue;
            }
            if self.is_cancelled(&visitor_id, &entry.run_id) {
                continue;
            }
            let audio = match self.synthesizer.synthesize(&entry.text).await {
                Ok(audio) => audio,
                Err(e) => {
                    warn!(
                        visitor_id = %visitor_id,
                        run_id = %entry.run_id,
                        error = %e,
                        "Speech synthesis failed"
                    );
                    continue;
                }
            };
            if self.is_cancelled(&visitor_id, &entry.run_id) {
                debug!(visitor_id = %visitor_id, run_id = %entry.run_id, "Speech dropped after barge-in");
                continue;
            }
            let message = ServerMessage::SpeechAudio {
                audio_data: BASE64.encode(&audio),
                run_id: entry.run_id.clone(),
            };
            if let Err(e) = entry.sink.send(&message).await {
                debug!(visitor_id = %visitor_id, error = %e, "Failed to deliver speech audio");
            }
        }
        debug!(visitor_id = %visitor_id, "Speech queue drained");
    }
}
