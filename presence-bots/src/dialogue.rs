//! Text shaping and pacing for entity replies.
//!
//! Pure helpers used by the coordinator: cleaning up raw model output so it
//! reads like a chat line, human-looking read and typing delays, and the
//! small text blocks that go into prompts.

use std::fmt;
use std::time::Duration;

use presence_core::config::{DialogueConfig, PopulationConfig};
use presence_core::history::ChatHistory;
use presence_core::types::Persona;
use rand::Rng;

/// At most this many lines survive post-processing.
const MAX_REPLY_LINES: usize = 2;

/// Chat lines in the busy window that make the channel "busy".
const BUSY_MESSAGES: usize = 20;

/// Chat lines in the busy window that make the channel "moderately active".
const MODERATE_MESSAGES: usize = 8;

// ---------------------------------------------------------------------------
// Post-processing
// ---------------------------------------------------------------------------

fn strip_quotes(text: &str) -> &str {
    let mut text = text.trim();
    loop {
        let inner = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')));
        match inner {
            Some(inner) => text = inner.trim(),
            None => return text,
        }
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// Remove `Name:`, `<Name>` or `[Name]` at the start of the text.
fn strip_self_prefix<'a>(text: &'a str, name: &str) -> &'a str {
    for prefix in [format!("{name}:"), format!("<{name}>"), format!("[{name}]")] {
        if let Some(rest) = strip_prefix_ignore_case(text, &prefix) {
            return rest.trim_start();
        }
    }
    text
}

/// Cut to at most `max_chars` characters, preferring the last word boundary.
#[must_use]
pub fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(index) if index > 0 => cut[..index].trim_end().to_string(),
        _ => cut,
    }
}

/// Turn raw model output into a sendable chat message for `name`.
///
/// Strips wrapping quotes, a leading self-name, markdown emphasis and code
/// ticks; collapses whitespace; keeps at most two lines; enforces
/// `max_chars`. Returns `None` when nothing is left.
#[must_use]
pub fn postprocess_reply(raw: &str, name: &str, max_chars: usize) -> Option<String> {
    let text = strip_quotes(raw);
    let text = strip_quotes(strip_self_prefix(text, name));
    let text = text.replace(['*', '`'], "");

    let lines: Vec<String> = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .take(MAX_REPLY_LINES)
        .collect();
    let joined = truncate_at_word(&lines.join("\n"), max_chars);
    let joined = joined.trim();
    (!joined.is_empty()).then(|| joined.to_string())
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Random "reading" pause before composing a reply.
pub fn read_delay<R: Rng + ?Sized>(rng: &mut R, config: &DialogueConfig) -> Duration {
    let low = config.read_delay_min_ms.min(config.read_delay_max_ms);
    let high = config.read_delay_max_ms.max(low);
    Duration::from_millis(rng.gen_range(low..=high))
}

/// "Typing" pause proportional to the reply length, capped.
#[must_use]
pub fn typing_delay(text: &str, config: &DialogueConfig) -> Duration {
    let chars = u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
    Duration::from_millis(
        chars
            .saturating_mul(config.typing_ms_per_char)
            .min(config.typing_max_ms),
    )
}

// ---------------------------------------------------------------------------
// Busyness
// ---------------------------------------------------------------------------

/// How lively the channel is, as told to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Busyness {
    /// Few people, little chat.
    Quiet,
    /// Some activity.
    Moderate,
    /// Many people or a lot of chat; entities should mostly stay out.
    Busy,
}

impl Busyness {
    /// Classify from the real-participant count and recent chat volume.
    #[must_use]
    pub fn assess(real_count: usize, recent_messages: usize, config: &PopulationConfig) -> Self {
        if real_count > config.medium_threshold || recent_messages >= BUSY_MESSAGES {
            Self::Busy
        } else if real_count >= config.low_threshold || recent_messages >= MODERATE_MESSAGES {
            Self::Moderate
        } else {
            Self::Quiet
        }
    }
}

impl fmt::Display for Busyness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quiet => "quiet",
            Self::Moderate => "moderately active",
            Self::Busy => "busy",
        })
    }
}

// ---------------------------------------------------------------------------
// Prompt blocks
// ---------------------------------------------------------------------------

/// Interests as a comma list.
#[must_use]
pub fn format_interests(persona: &Persona) -> String {
    if persona.interests.is_empty() {
        "general chat".to_string()
    } else {
        persona.interests.join(", ")
    }
}

/// One `name: interests` line per candidate.
#[must_use]
pub fn format_roster(candidates: &[Persona]) -> String {
    candidates
        .iter()
        .map(|p| format!("{}: {}", p.username, format_interests(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The digest plus the newest `n` lines, or a placeholder when empty.
#[must_use]
pub fn history_block(history: &ChatHistory, n: usize) -> String {
    let live = history.render(n);
    match (history.summary().is_empty(), live.is_empty()) {
        (true, true) => "(nothing yet)".to_string(),
        (true, false) => live,
        (false, true) => format!("Earlier: {}", history.summary()),
        (false, false) => format!("Earlier: {}\n{live}", history.summary()),
    }
}

/// Memory section of the reply prompt; empty when nothing is remembered.
#[must_use]
pub fn memory_block(memory: &str) -> String {
    if memory.trim().is_empty() {
        String::new()
    } else {
        format!("\nWhat you remember:\n{}\n", memory.trim())
    }
}

/// Server facts, offered only for world-knowledge questions.
#[must_use]
pub fn knowledge_block(knowledge: &str, world_question: bool) -> String {
    if !world_question || knowledge.trim().is_empty() {
        String::new()
    } else {
        format!("\nServer facts:\n{}\n", knowledge.trim())
    }
}
