//! Prompt templates for presence completions.
//!
//! Every prompt is a versioned, testable artifact. The built-in templates
//! below are used unless a TOML override directory supplies a replacement.
//! Optional blocks (memory, server knowledge, ...) are passed pre-rendered,
//! so an empty value simply leaves no trace in the prompt.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::LlmError;
use crate::types::CompletionRequest;

/// Reply prompt: one entity answering chat.
pub const REPLY_SYSTEM: &str = r"You are {name}, a regular player on a Minecraft server, chatting in the public game chat.
Your personality: {personality}

RULES:
- Write like a real player: short, casual, lowercase is fine.
- One or two short sentences, never more than {max_chars} characters.
- Never say you are an AI, a bot or a language model.
- Do not prefix your message with your name or wrap it in quotes.
{knowledge_block}{memory_block}";

/// Reply prompt, user part.
pub const REPLY_USER: &str = r"Recent chat:
{history}

{sender} just said: {message}

Reply as {name}.";

/// Orchestrator prompt: pick at most one entity to answer.
pub const ORCHESTRATOR_SYSTEM: &str = r"You decide which simulated player, if any, should answer a chat message on a game server.
Candidates (name: interests):
{roster}

The server is currently {busyness}. When it is busy, prefer letting nobody answer.
Only pick someone whose interests fit the message or when the message clearly invites anyone to answer.
Respond with JSON only, no commentary.";

/// Orchestrator prompt, user part.
pub const ORCHESTRATOR_USER: &str = r#"Recent chat:
{history}

New message from {sender}: {message}

Return JSON: {"pick": "<candidate name or null>", "world_question": <true if the message asks about the server or world itself>}"#;

/// Chatter prompt: an unprompted remark.
pub const CHATTER_SYSTEM: &str = r"You are {name}, a regular player on a Minecraft server.
Your personality: {personality}
Your interests: {interests}

Say something short and natural in the public chat, as if thinking out loud or starting a conversation.
One sentence, casual, no more than {max_chars} characters. Never mention being an AI.";

/// Chatter prompt, user part.
pub const CHATTER_USER: &str = r"Recent chat:
{history}

Do not repeat these recent topics: {avoid_topics}
{address_hint}
Write your message now.";

/// Memory evaluation prompt: is this exchange worth remembering?
pub const MEMORY_EVALUATION_SYSTEM: &str = r"You manage the long-term memory of {name}, a player on a game server.
Decide whether an exchange contains something worth remembering later: names, plans, preferences, promises, facts about players.
Small talk and greetings are not worth remembering.";

/// Memory evaluation prompt, user part.
pub const MEMORY_EVALUATION_USER: &str = r"{sender} said: {message}
{name} replied: {reply}

Answer exactly one line:
YES: <one short note to remember>
or
NO";

/// Memory compaction prompt: fold old notes into the summary.
pub const MEMORY_COMPACTION_SYSTEM: &str = r"You condense the memory notes of {name}, a player on a game server.
Keep names, relationships, plans and preferences. Drop small talk.
Write at most three sentences of plain text.";

/// Memory compaction prompt, user part.
pub const MEMORY_COMPACTION_USER: &str = r"Current summary:
{summary}

Notes to fold in:
{entries}

Write the new summary.";

/// Simple template interpolation for prompts.
///
/// Replaces `{key}` with the corresponding value. Unknown placeholders are
/// left intact.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

// ---------------------------------------------------------------------------
// PromptEngine
// ---------------------------------------------------------------------------

/// Identifies a prompt template by purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptId {
    /// Entity reply to chat.
    Reply,
    /// Pick who answers an unaddressed message.
    Orchestrator,
    /// Unprompted idle remark.
    Chatter,
    /// Decide whether an exchange is memorable.
    MemoryEvaluation,
    /// Fold old memory notes into the summary.
    MemoryCompaction,
}

impl PromptId {
    /// Returns the TOML filename (without path) for this prompt.
    #[must_use]
    pub fn filename(self) -> &'static str {
        match self {
            Self::Reply => "reply.toml",
            Self::Orchestrator => "orchestrator.toml",
            Self::Chatter => "chatter.toml",
            Self::MemoryEvaluation => "memory_evaluation.toml",
            Self::MemoryCompaction => "memory_compaction.toml",
        }
    }

    /// All prompt IDs.
    #[must_use]
    pub fn all() -> &'static [PromptId] {
        &[
            Self::Reply,
            Self::Orchestrator,
            Self::Chatter,
            Self::MemoryEvaluation,
            Self::MemoryCompaction,
        ]
    }

    /// Placeholder keys this template recognises.
    #[must_use]
    pub fn placeholders(self) -> &'static [&'static str] {
        match self {
            Self::Reply => &[
                "name",
                "personality",
                "max_chars",
                "knowledge_block",
                "memory_block",
                "history",
                "sender",
                "message",
            ],
            Self::Orchestrator => &["roster", "busyness", "history", "sender", "message"],
            Self::Chatter => &[
                "name",
                "personality",
                "interests",
                "max_chars",
                "history",
                "avoid_topics",
                "address_hint",
            ],
            Self::MemoryEvaluation => &["name", "sender", "message", "reply"],
            Self::MemoryCompaction => &["name", "summary", "entries"],
        }
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reply => "reply",
            Self::Orchestrator => "orchestrator",
            Self::Chatter => "chatter",
            Self::MemoryEvaluation => "memory_evaluation",
            Self::MemoryCompaction => "memory_compaction",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PromptId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reply" => Ok(Self::Reply),
            "orchestrator" => Ok(Self::Orchestrator),
            "chatter" => Ok(Self::Chatter),
            "memory_evaluation" => Ok(Self::MemoryEvaluation),
            "memory_compaction" => Ok(Self::MemoryCompaction),
            _ => Err(format!("unknown prompt id: '{s}'")),
        }
    }
}

/// Metadata and templates parsed from a TOML prompt file.
#[derive(Debug, Clone, Deserialize)]
struct TomlPromptFile {
    prompt: TomlPromptData,
}

/// Inner `[prompt]` section of a TOML file.
#[derive(Debug, Clone, Deserialize)]
struct TomlPromptData {
    version: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    user: String,
}

/// A loaded, ready-to-render prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    /// Prompt version string (e.g., "1.0").
    pub version: String,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// System prompt template (contains `{key}` placeholders).
    pub system: String,
    /// User prompt template (contains `{key}` placeholders).
    pub user: String,
}

impl PromptTemplate {
    fn builtin(system: &str, user: &str, max_tokens: u32, temperature: f32) -> Self {
        Self {
            version: "builtin".into(),
            max_tokens,
            temperature,
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Holds one template per [`PromptId`] and renders them.
#[derive(Debug, Clone)]
pub struct PromptEngine {
    templates: HashMap<PromptId, PromptTemplate>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PromptEngine {
    /// Create an engine with the compiled-in templates.
    #[must_use]
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            PromptId::Reply,
            PromptTemplate::builtin(REPLY_SYSTEM, REPLY_USER, 80, 0.9),
        );
        templates.insert(
            PromptId::Orchestrator,
            PromptTemplate::builtin(ORCHESTRATOR_SYSTEM, ORCHESTRATOR_USER, 60, 0.2),
        );
        templates.insert(
            PromptId::Chatter,
            PromptTemplate::builtin(CHATTER_SYSTEM, CHATTER_USER, 60, 1.0),
        );
        templates.insert(
            PromptId::MemoryEvaluation,
            PromptTemplate::builtin(MEMORY_EVALUATION_SYSTEM, MEMORY_EVALUATION_USER, 60, 0.2),
        );
        templates.insert(
            PromptId::MemoryCompaction,
            PromptTemplate::builtin(MEMORY_COMPACTION_SYSTEM, MEMORY_COMPACTION_USER, 200, 0.3),
        );
        Self { templates }
    }

    /// Load TOML overrides from a directory, falling back to the builtin
    /// template for every file that is absent.
    ///
    /// # Errors
    ///
    /// [`LlmError::ConfigError`] if the directory is missing or a TOML file
    /// exists but cannot be read or parsed.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self, LlmError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LlmError::ConfigError(format!(
                "prompt directory not found: {}",
                dir.display()
            )));
        }

        let mut engine = Self::builtin();
        let mut overridden = 0usize;
        for id in PromptId::all() {
            let path = dir.join(id.filename());
            if !path.exists() {
                debug!(prompt = %id, "No override, using builtin template");
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| {
                LlmError::ConfigError(format!("failed to read {}: {e}", path.display()))
            })?;
            let parsed: TomlPromptFile = toml::from_str(&content).map_err(|e| {
                LlmError::ConfigError(format!("failed to parse {}: {e}", path.display()))
            })?;

            let d = parsed.prompt;
            engine.templates.insert(
                *id,
                PromptTemplate {
                    version: d.version,
                    max_tokens: d.max_tokens,
                    temperature: d.temperature,
                    system: d.system,
                    user: d.user,
                },
            );
            overridden += 1;
        }

        info!(dir = %dir.display(), overridden, "Prompt templates loaded");
        Ok(engine)
    }

    /// Get a loaded prompt template by ID.
    #[must_use]
    pub fn get(&self, id: PromptId) -> Option<&PromptTemplate> {
        self.templates.get(&id)
    }

    /// Render both system and user prompts for a given ID.
    ///
    /// Returns `(system_prompt, user_prompt)`.
    ///
    /// # Errors
    ///
    /// [`LlmError::ConfigError`] if the prompt ID is not loaded.
    pub fn render(&self, id: PromptId, vars: &[(&str, &str)]) -> Result<(String, String), LlmError> {
        let tpl = self
            .get(id)
            .ok_or_else(|| LlmError::ConfigError(format!("prompt template '{id}' not loaded")))?;
        Ok((
            render_template(&tpl.system, vars),
            render_template(&tpl.user, vars),
        ))
    }

    /// Render a template into a request carrying its token cap and
    /// temperature.
    ///
    /// # Errors
    ///
    /// [`LlmError::ConfigError`] if the prompt ID is not loaded.
    pub fn request(&self, id: PromptId, vars: &[(&str, &str)]) -> Result<CompletionRequest, LlmError> {
        let (system, user) = self.render(id, vars)?;
        let tpl = self
            .get(id)
            .ok_or_else(|| LlmError::ConfigError(format!("prompt template '{id}' not loaded")))?;
        Ok(CompletionRequest::new(system, user)
            .with_max_tokens(tpl.max_tokens)
            .with_temperature(tpl.temperature))
    }

    /// Number of loaded templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether no templates are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
