//! Core type definitions shared by every presence crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

/// A simulated participant as configured in the roster file.
///
/// The display name is the identity: it is what other participants type,
/// what the transport logs in with, and the key for memory records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Unique display name.
    pub username: String,
    /// Free-text personality, used only as a prompt fragment.
    #[serde(default)]
    pub personality: String,
    /// Probability in `[0, 1]` of speaking when offered an idle turn.
    #[serde(default = "default_chattiness")]
    pub chattiness: f64,
    /// Interest tags offered to the orchestrator.
    #[serde(default)]
    pub interests: Vec<String>,
    /// Exempt from automatic parking.
    #[serde(default)]
    pub priority: bool,
    /// Connected but silent.
    #[serde(default)]
    pub muted: bool,
}

impl Persona {
    /// Create a persona with default traits.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            personality: String::new(),
            chattiness: default_chattiness(),
            interests: Vec::new(),
            priority: false,
            muted: false,
        }
    }

    /// Builder-style personality setter.
    #[must_use]
    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    /// Builder-style interest setter.
    #[must_use]
    pub fn with_interests<I, S>(mut self, interests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interests = interests.into_iter().map(Into::into).collect();
        self
    }
}

fn default_chattiness() -> f64 {
    0.5
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// One line of chat as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Display name of whoever said it.
    pub sender: String,
    /// Message text.
    pub text: String,
    /// Wall-clock time it was observed.
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    /// Create a chat event stamped with the current time.
    #[must_use]
    pub fn now(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Render as `sender: text`, the form used in prompts and digests.
    #[must_use]
    pub fn line(&self) -> String {
        format!("{}: {}", self.sender, self.text)
    }
}

/// Whether a name belongs to a simulated participant, compared case-insensitively.
#[must_use]
pub fn is_simulated(name: &str, roster: &[Persona]) -> bool {
    roster.iter().any(|p| p.username.eq_ignore_ascii_case(name))
}
