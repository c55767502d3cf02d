//! Core types for completion requests and responses.

use serde::{Deserialize, Serialize};

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions.
    System,
    /// Input the model responds to.
    User,
    /// Earlier model output.
    Assistant,
}

/// One message in the conversation handed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who said it.
    pub role: ChatRole,
    /// What was said.
    pub content: String,
}

impl ChatTurn {
    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A request to the completion service.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    /// System prompt (persona, rules, constraints).
    pub system: String,
    /// Conversation turns, oldest first.
    pub turns: Vec<ChatTurn>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f32,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl CompletionRequest {
    /// Create a request with a single user turn.
    #[must_use]
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            turns: vec![ChatTurn::user(user)],
            max_tokens: 80,
            temperature: 0.7,
            timeout_ms: 15_000,
        }
    }

    /// Set the token cap.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// The newest user turn, if any.
    #[must_use]
    pub fn last_user_turn(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == ChatRole::User)
            .map(|t| t.content.as_str())
    }
}

/// A response from the completion service.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    /// The generated text.
    pub text: String,
    /// How many tokens were generated.
    pub tokens_generated: u32,
    /// Latency in milliseconds.
    pub latency_ms: u64,
    /// Which model answered.
    pub model: String,
}

impl CompletionResponse {
    /// A response carrying only text, for fakes and fixed answers.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_generated: 0,
            latency_ms: 0,
            model: String::new(),
        }
    }
}

/// Orchestrator decision: who, if anyone, should answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OrchestratorPick {
    /// Chosen entity name; `None` declines.
    #[serde(default)]
    pub pick: Option<String>,
    /// The message asks about the server or world itself.
    #[serde(default)]
    pub world_question: bool,
}

/// Whether an exchange is worth remembering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryVerdict {
    /// Keep this short note.
    Remember(String),
    /// Nothing worth keeping.
    Forget,
}
