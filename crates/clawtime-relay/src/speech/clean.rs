//! Markdown-to-speech text cleanup.

use std::sync::LazyLock;

use regex::Regex;

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\w+-]*").expect("static regex is valid"));
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!?\[([^\]]*)\]\(([^)\s]*)(?:\s[^)]*)?\)").expect("static regex is valid")
});
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("static regex is valid"));
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s+").expect("static regex is valid"));
static QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*>\s?").expect("static regex is valid"));
static EMPHASIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*+|~~|\b__|__\b").expect("static regex is valid"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex is valid"));

/// Word spoken in place of a bare URL.
pub const URL_PLACEHOLDER: &str = "link";

/// Reduce a markdown fragment to plain speakable text.
pub fn clean_for_speech(text: &str) -> String {
    let text = CODE_FENCE_RE.replace_all(text, "");
    let text = text.replace('`', "");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = URL_RE.replace_all(&text, URL_PLACEHOLDER);
    let text = HEADING_RE.replace_all(&text, "");
    let text = QUOTE_RE.replace_all(&text, "");
    let text = EMPHASIS_RE.replace_all(&text, "");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}
