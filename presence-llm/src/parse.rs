//! Lenient parsing of structured model output.
//!
//! Small local models wrap JSON in code fences, add chatter around it, or
//! ignore the format entirely. These helpers take the best reading they can
//! and never fail; a reading they cannot make sense of comes back as a
//! decline.

use crate::types::{MemoryVerdict, OrchestratorPick};

/// Words a model uses to mean "nobody".
const DECLINE_WORDS: &[&str] = &["none", "null", "nobody", "no one", "noone", "no", "n/a", ""];

fn is_decline(name: &str) -> bool {
    DECLINE_WORDS.contains(&name.trim().to_ascii_lowercase().as_str())
}

/// The first `{ ... }` span in `text`, if any.
fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn clean_token(raw: &str) -> &str {
    raw.trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '.' | ',' | '!' | ':'))
}

/// Read an orchestrator decision.
///
/// Accepts `{"pick": "Name" | null, "world_question": bool}` (optionally
/// fenced or surrounded by text) and falls back to a bare single-word name.
/// Roster membership is the caller's check.
#[must_use]
pub fn parse_orchestrator_pick(text: &str) -> OrchestratorPick {
    if let Some(raw) = json_object(text) {
        if let Ok(mut pick) = serde_json::from_str::<OrchestratorPick>(raw) {
            if pick.pick.as_deref().is_some_and(is_decline) {
                pick.pick = None;
            }
            pick.pick = pick.pick.map(|p| clean_token(&p).to_string());
            return pick;
        }
    }

    let first_line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("```"))
        .unwrap_or_default();
    let candidate = clean_token(first_line);
    if candidate.split_whitespace().count() != 1 || is_decline(candidate) {
        return OrchestratorPick::default();
    }
    OrchestratorPick {
        pick: Some(candidate.to_string()),
        world_question: false,
    }
}

/// Read a `YES: note` / `NO` memory verdict. Anything else is `Forget`.
#[must_use]
pub fn parse_memory_verdict(text: &str) -> MemoryVerdict {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let Some(prefix) = line.get(..3) else {
        return MemoryVerdict::Forget;
    };
    let rest = &line[3..];
    if !prefix.eq_ignore_ascii_case("yes") || rest.chars().next().is_some_and(char::is_alphanumeric)
    {
        return MemoryVerdict::Forget;
    }
    let note = rest
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | ','))
        .trim();
    if note.is_empty() {
        MemoryVerdict::Forget
    } else {
        MemoryVerdict::Remember(note.to_string())
    }
}
