//! Text cleanup before speech synthesis.

use once_cell::sync::Lazy;
use regex::Regex;

/// Spoken when nothing pronounceable survives sanitizing.
pub const ACKNOWLEDGEMENT: &str = "Command acknowledged.";

static MARKDOWN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*_#~`>]").unwrap());
static LINKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*?\]\(.*?\)").unwrap());
static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"[\x{1F600}-\x{1F64F}\x{1F300}-\x{1F5FF}\x{1F680}-\x{1F6FF}",
        r"\x{1F1E0}-\x{1F1FF}\x{2600}-\x{26FF}\x{2700}-\x{27BF}]"
    ))
    .unwrap()
});
static BRACKETS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[{}|\[\]\\]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip markdown markers, links, emoji and structural brackets, then collapse
/// whitespace. Never returns an empty string.
pub fn sanitize_for_speech(text: &str) -> String {
    let cleaned = MARKDOWN.replace_all(text, "");
    let cleaned = LINKS.replace_all(&cleaned, "");
    let cleaned = EMOJI.replace_all(&cleaned, "");
    let cleaned = BRACKETS.replace_all(&cleaned, " ");
    let cleaned = WHITESPACE.replace_all(&cleaned, " ");
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        ACKNOWLEDGEMENT.to_string()
    } else {
        cleaned.to_string()
    }
}
