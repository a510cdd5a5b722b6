//! Sentence-level text-to-speech pipeline.
//!
//! The [`SpeechSegmenter`] turns the growing reply text of a run into
//! speakable sentences, [`clean_for_speech`] strips markup from each, and the
//! [`SpeechQueue`] synthesizes them one at a time per visitor.

pub mod clean;
pub mod command;
pub mod queue;
pub mod segmenter;

use std::time::Duration;

use futures_util::future::BoxFuture;

pub use clean::clean_for_speech;
pub use command::{CommandSynthesizer, CommandTranscriber, shell_escape};
pub use queue::{SpeechEntry, SpeechQueue};
pub use segmenter::SpeechSegmenter;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("failed to start speech command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("speech command timed out after {0:?}")]
    Timeout(Duration),

    #[error("speech command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("speech command produced no output")]
    EmptyOutput,

    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("speech I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns one cleaned sentence into encoded audio bytes.
pub trait Synthesizer: Send + Sync {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SpeechError>>;
}
