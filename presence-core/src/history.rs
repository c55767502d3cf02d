//! Shared chat history with a rolling digest of everything older.
//!
//! The live sequence never exceeds its capacity. Events pushed out of the
//! front are folded into a compacted summary string, which only ever grows
//! by concatenation and is trimmed from its oldest end once it passes its
//! byte cap.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::HistoryConfig;
use crate::types::ChatEvent;

/// Separator between folded lines in the compacted summary.
const DIGEST_SEPARATOR: &str = " | ";

/// Bounded, most-recent-last chat history.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    events: VecDeque<ChatEvent>,
    capacity: usize,
    summary: String,
    summary_max_chars: usize,
}

impl ChatHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            events: VecDeque::with_capacity(config.max_length + 1),
            capacity: config.max_length.max(1),
            summary: String::new(),
            summary_max_chars: config.summary_max_chars,
        }
    }

    /// Append an event, folding overflow into the summary.
    pub fn push(&mut self, event: ChatEvent) {
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            if let Some(old) = self.events.pop_front() {
                self.fold(&old);
            }
        }
    }

    fn fold(&mut self, event: &ChatEvent) {
        if !self.summary.is_empty() {
            self.summary.push_str(DIGEST_SEPARATOR);
        }
        self.summary.push_str(&event.line());

        if self.summary.len() > self.summary_max_chars {
            let mut cut = self.summary.len() - self.summary_max_chars;
            while !self.summary.is_char_boundary(cut) {
                cut += 1;
            }
            self.summary.drain(..cut);
        }
    }

    /// Live events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &ChatEvent> {
        self.events.iter()
    }

    /// The newest `n` events, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<&ChatEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).collect()
    }

    /// Digest of events that fell out of the live window.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Number of live events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no live events are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live events observed at or after `since`.
    #[must_use]
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.events.iter().filter(|e| e.timestamp >= since).count()
    }

    /// Render the live window as `sender: text` lines for prompts.
    #[must_use]
    pub fn render(&self, n: usize) -> String {
        self.tail(n)
            .iter()
            .map(|e| e.line())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
