//! Sentence extraction from a growing reply text.

use std::collections::{HashMap, HashSet};

use super::clean::clean_for_speech;

/// Units this short (after trimming) are not worth speaking.
const MIN_UNIT_CHARS: usize = 3;

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ':')
}

/// Byte length of the first complete unit in `text`, if any.
///
/// A unit ends after a terminator followed by whitespace or end of input, or
/// after a newline.
fn next_unit_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            return Some(i + 1);
        }
        if is_terminator(c) {
            match chars.peek() {
                None => return Some(i + c.len_utf8()),
                Some((_, next)) if next.is_whitespace() => return Some(i + c.len_utf8()),
                Some(_) => {}
            }
        }
    }
    None
}

fn speakable(unit: &str) -> Option<String> {
    let unit = unit.trim();
    if unit.chars().count() < MIN_UNIT_CHARS {
        return None;
    }
    let cleaned = clean_for_speech(unit);
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Tracks how much of each run's text has already been sent to synthesis.
#[derive(Debug, Default)]
pub struct SpeechSegmenter {
    /// Bytes of the run's text already dispatched.
    spoken: HashMap<String, usize>,
    barged: HashSet<String>,
}

impl SpeechSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_barged(&self, run_id: &str) -> bool {
        self.barged.contains(run_id)
    }

    /// Complete sentences of `text` not yet dispatched, cleaned, in order.
    pub fn on_delta(&mut self, run_id: &str, text: &str) -> Vec<String> {
        if self.is_barged(run_id) {
            return Vec::new();
        }
        let offset = self.spoken.get(run_id).copied().unwrap_or(0);
        let Some(rest) = text.get(offset..) else {
            return Vec::new();
        };

        let mut units = Vec::new();
        let mut consumed = 0;
        while let Some(end) = next_unit_end(&rest[consumed..]) {
            if let Some(unit) = speakable(&rest[consumed..consumed + end]) {
                units.push(unit);
            }
            consumed += end;
        }
        if consumed > 0 {
            self.spoken.insert(run_id.to_string(), offset + consumed);
        }
        units
    }

    /// Remaining sentences of the finished `text`, including an unterminated
    /// tail. Clears the run's bookkeeping.
    pub fn on_final(&mut self, run_id: &str, text: &str) -> Vec<String> {
        if self.is_barged(run_id) {
            self.spoken.remove(run_id);
            return Vec::new();
        }
        let mut units = self.on_delta(run_id, text);
        let offset = self.spoken.remove(run_id).unwrap_or(0);
        if let Some(tail) = text.get(offset..).and_then(speakable) {
            units.push(tail);
        }
        units
    }

    /// Stop speaking `run_id` for good.
    pub fn barge_in(&mut self, run_id: &str) {
        self.spoken.remove(run_id);
        self.barged.insert(run_id.to_string());
    }

    /// Drop bookkeeping for a run that ended without a reply.
    pub fn forget(&mut self, run_id: &str) {
        self.spoken.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_sentences_then_flushes_tail() {
        let mut seg = SpeechSegmenter::new();
        assert_eq!(seg.on_delta("r1", "Hello world! Testing"), vec!["Hello world!"]);
        assert_eq!(
            seg.on_final("r1", "Hello world! Testing complete."),
            vec!["Testing complete."]
        );
    }

    #[test]
    fn nothing_is_spoken_twice() {
        let mut seg = SpeechSegmenter::new();
        assert_eq!(seg.on_delta("r1", "One. Two"), vec!["One."]);
        assert!(seg.on_delta("r1", "One. Two").is_empty());
        assert_eq!(seg.on_delta("r1", "One. Two. Three? Four"), vec!["Two.", "Three?"]);
        assert_eq!(seg.on_final("r1", "One. Two. Three? Four"), vec!["Four"]);
    }

    #[test]
    fn terminator_inside_token_does_not_split() {
        let mut seg = SpeechSegmenter::new();
        assert!(seg.on_delta("r1", "Version 3.14 is").is_empty());
        assert_eq!(seg.on_final("r1", "Version 3.14 is out"), vec!["Version 3.14 is out"]);
    }

    #[test]
    fn newline_terminated_lines_are_units() {
        let mut seg = SpeechSegmenter::new();
        assert_eq!(
            seg.on_delta("r1", "Steps\n- install it\n- run it\n- ok\n"),
            vec!["Steps", "- install it", "- run it", "- ok"]
        );
    }

    #[test]
    fn tiny_units_are_skipped() {
        let mut seg = SpeechSegmenter::new();
        assert_eq!(seg.on_delta("r1", "1. Go home. "), vec!["Go home."]);
    }

    #[test]
    fn barge_in_is_permanent() {
        let mut seg = SpeechSegmenter::new();
        assert_eq!(seg.on_delta("r1", "First. Second"), vec!["First."]);
        seg.barge_in("r1");
        assert!(seg.on_delta("r1", "First. Second. Third.").is_empty());
        assert!(seg.on_final("r1", "First. Second. Third.").is_empty());
        assert!(seg.is_barged("r1"));
        assert_eq!(seg.on_delta("r2", "Other run."), vec!["Other run."]);
    }

    #[test]
    fn shorter_text_than_spoken_is_ignored() {
        let mut seg = SpeechSegmenter::new();
        seg.on_delta("r1", "A long first sentence. ");
        assert!(seg.on_final("r1", "A long").is_empty());
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let mut seg = SpeechSegmenter::new();
        assert_eq!(seg.on_delta("r1", "Grüße! Schön"), vec!["Grüße!"]);
        assert_eq!(seg.on_final("r1", "Grüße! Schön…"), vec!["Schön…"]);
    }
}
