//! Content safety for generated text and sensitive-topic detection.
//!
//! Two separate concerns live here:
//!   - [`ContentCheck`]: decides whether a generated reply may be sent at all.
//!     A rejection is a deliberate drop, never retried or replaced.
//!   - [`SensitiveTopicFilter`]: marks inbound chat (deaths, loss) that must
//!     stay out of orchestrator dispatch.

use crate::config::SafetyConfig;

/// Result of a safety check on outbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    /// Text may be sent.
    Approved,
    /// Text must be dropped.
    Rejected {
        /// Why the text was rejected.
        reason: String,
    },
}

impl SafetyVerdict {
    /// Whether the verdict allows sending.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Pluggable outbound content check.
pub trait ContentCheck: Send + Sync {
    /// Judge one candidate message.
    fn check(&self, text: &str) -> SafetyVerdict;
}

/// Case-insensitive phrase blocklist.
#[derive(Debug, Clone, Default)]
pub struct BlocklistFilter {
    phrases: Vec<String>,
}

impl BlocklistFilter {
    /// Build from raw phrases; empty entries are ignored.
    #[must_use]
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Build from the configured blocklist.
    #[must_use]
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(&config.blocklist)
    }
}

impl ContentCheck for BlocklistFilter {
    fn check(&self, text: &str) -> SafetyVerdict {
        let lower = text.to_lowercase();
        match self.phrases.iter().find(|p| lower.contains(p.as_str())) {
            Some(phrase) => SafetyVerdict::Rejected {
                reason: format!("blocked phrase '{phrase}'"),
            },
            None => SafetyVerdict::Approved,
        }
    }
}

/// Keyword detector for topics the orchestrator must not handle.
#[derive(Debug, Clone, Default)]
pub struct SensitiveTopicFilter {
    keywords: Vec<String>,
}

impl SensitiveTopicFilter {
    /// Build from raw keywords; matching is case-insensitive.
    ///
    /// Keywords keep their own spacing, so `"rip "` will not match "ripe".
    #[must_use]
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.trim().is_empty())
                .collect(),
        }
    }

    /// Build from the configured keyword list.
    #[must_use]
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(&config.sensitive_keywords)
    }

    /// Whether the message touches a sensitive topic.
    #[must_use]
    pub fn is_sensitive(&self, text: &str) -> bool {
        // Pad so keywords with edge spaces still match at the ends.
        let padded = format!(" {} ", text.to_lowercase());
        self.keywords.iter().any(|k| padded.contains(k.as_str()))
    }
}
