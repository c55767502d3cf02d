//! Configuration for the presence engine.
//!
//! Maps directly to `presence.toml`. Every knob has a default, so an empty
//! file plus a transport host is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::{PresenceError, Result};

/// Top-level presence configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresenceConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Chat transport connection settings.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Completion service settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Shared chat history.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Global rate window.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Reply pacing, cooldowns and conversation links.
    #[serde(default)]
    pub dialogue: DialogueConfig,
    /// Unprompted chatter.
    #[serde(default)]
    pub chatter: ChatterConfig,
    /// Population sizing.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Reconnect and kick backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Per-entity memory.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Content safety.
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl PresenceConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `PresenceError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| PresenceError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check the invariants a running engine relies on.
    ///
    /// This is the only check allowed to stop the process.
    ///
    /// # Errors
    /// Returns `PresenceError::Config` describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.transport.host.trim().is_empty() {
            return Err(PresenceError::Config("transport.host is required".into()));
        }
        if self.history.max_length == 0 {
            return Err(PresenceError::Config("history.max_length must be at least 1".into()));
        }
        if self.memory.max_recent == 0 || self.memory.keep_after_compact >= self.memory.max_recent {
            return Err(PresenceError::Config(format!(
                "memory.keep_after_compact ({}) must be below memory.max_recent ({})",
                self.memory.keep_after_compact, self.memory.max_recent
            )));
        }
        let p = &self.population;
        if !(p.low_threshold <= p.medium_threshold && p.medium_threshold <= p.high_threshold) {
            return Err(PresenceError::Config(format!(
                "population thresholds must be ordered: low {} <= medium {} <= high {}",
                p.low_threshold, p.medium_threshold, p.high_threshold
            )));
        }
        if self.dialogue.read_delay_min_ms > self.dialogue.read_delay_max_ms
            || self.chatter.min_interval_secs > self.chatter.max_interval_secs
            || p.jitter_min_secs > p.jitter_max_secs
            || self.reconnect.settle_min_secs > self.reconnect.settle_max_secs
        {
            return Err(PresenceError::Config("a min/max range is inverted".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json_logs: bool,
    /// Facts about the server, offered when a message is a world-knowledge question.
    #[serde(default)]
    pub server_knowledge: String,
    /// Roster file (JSON array of personas).
    #[serde(default = "default_roster_path")]
    pub roster_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            server_knowledge: String::new(),
            roster_path: default_roster_path(),
        }
    }
}

/// Chat transport connection settings, handed to the transport as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Server host. Required.
    #[serde(default)]
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Protocol version hint; empty means auto-detect.
    #[serde(default)]
    pub version: String,
    /// Authentication mode.
    #[serde(default = "default_auth")]
    pub auth: String,
    /// Delay between lines of a multi-line message.
    #[serde(default = "default_800")]
    pub line_delay_ms: u64,
    /// Spacing between initial connections at startup.
    #[serde(default = "default_5")]
    pub connect_stagger_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 25565,
            version: String::new(),
            auth: default_auth(),
            line_delay_ms: 800,
            connect_stagger_secs: 5,
        }
    }
}

/// Completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: "ollama", "openai", "none".
    #[serde(default = "default_ollama")]
    pub provider: String,
    /// Base URL for the API.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// API key for OpenAI-compatible providers.
    #[serde(default)]
    pub api_key: String,
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Hard timeout for any completion call in milliseconds.
    #[serde(default = "default_15000")]
    pub request_timeout_ms: u64,
    /// Token cap for chat replies.
    #[serde(default = "default_80")]
    pub reply_max_tokens: u32,
    /// Sampling temperature for chat replies.
    #[serde(default = "default_0_9")]
    pub reply_temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_ollama(),
            base_url: default_ollama_url(),
            api_key: String::new(),
            model: default_model(),
            request_timeout_ms: 15_000,
            reply_max_tokens: 80,
            reply_temperature: 0.9,
        }
    }
}

/// Shared chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Live events kept verbatim.
    #[serde(default = "default_20")]
    pub max_length: usize,
    /// Byte cap on the compacted digest of older events.
    #[serde(default = "default_500")]
    pub summary_max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            summary_max_chars: 500,
        }
    }
}

/// Global sliding rate window across all simulated entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// When false the window is unbounded.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Window length in seconds.
    #[serde(default = "default_300")]
    pub window_secs: u64,
    /// Maximum sends inside the window.
    #[serde(default = "default_30")]
    pub max_messages: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 300,
            max_messages: 30,
        }
    }
}

/// Reply pacing, cooldowns and conversation links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Minimum interval between two messages of one entity.
    #[serde(default = "default_8")]
    pub cooldown_secs: u64,
    /// Lifetime of a player → entity conversation link.
    #[serde(default = "default_30_u64")]
    pub link_ttl_secs: u64,
    /// Lower bound of the simulated reading delay.
    #[serde(default = "default_1500")]
    pub read_delay_min_ms: u64,
    /// Upper bound of the simulated reading delay.
    #[serde(default = "default_4000")]
    pub read_delay_max_ms: u64,
    /// Simulated typing time per reply character.
    #[serde(default = "default_45")]
    pub typing_ms_per_char: u64,
    /// Cap on the simulated typing delay.
    #[serde(default = "default_6000")]
    pub typing_max_ms: u64,
    /// Replies longer than this are cut at a word boundary.
    #[serde(default = "default_200")]
    pub max_reply_chars: usize,
    /// Window used to measure how busy the channel is.
    #[serde(default = "default_120")]
    pub busy_window_secs: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 8,
            link_ttl_secs: 30,
            read_delay_min_ms: 1500,
            read_delay_max_ms: 4000,
            typing_ms_per_char: 45,
            typing_max_ms: 6000,
            max_reply_chars: 200,
            busy_window_secs: 120,
        }
    }
}

/// Unprompted chatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatterConfig {
    /// Whether idle chatter runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shortest pause between chatter attempts.
    #[serde(default = "default_90")]
    pub min_interval_secs: u64,
    /// Longest pause between chatter attempts.
    #[serde(default = "default_300")]
    pub max_interval_secs: u64,
    /// Size of the anti-repetition buffer.
    #[serde(default = "default_8_usize")]
    pub recent_topics: usize,
    /// Chance that a chatter line addresses another entity by name.
    #[serde(default = "default_0_15")]
    pub address_probability: f64,
    /// Window for counting entity-to-entity exchanges per pair.
    #[serde(default = "default_600")]
    pub pair_window_secs: u64,
    /// Exchanges allowed per pair inside the window.
    #[serde(default = "default_4")]
    pub pair_max_exchanges: usize,
}

impl Default for ChatterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: 90,
            max_interval_secs: 300,
            recent_topics: 8,
            address_probability: 0.15,
            pair_window_secs: 600,
            pair_max_exchanges: 4,
        }
    }
}

/// Population sizing against the count of real participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Rebalance period.
    #[serde(default = "default_45")]
    pub tick_secs: u64,
    /// Below this many real participants the channel counts as quiet.
    #[serde(default = "default_3_usize")]
    pub low_threshold: usize,
    /// Above this many real participants only 75% of the roster stays active.
    #[serde(default = "default_6_usize")]
    pub medium_threshold: usize,
    /// Above this many real participants only 50% of the roster stays active.
    #[serde(default = "default_10_usize")]
    pub high_threshold: usize,
    /// Shortest jitter refresh period.
    #[serde(default = "default_720")]
    pub jitter_min_secs: u64,
    /// Longest jitter refresh period.
    #[serde(default = "default_1080")]
    pub jitter_max_secs: u64,
    /// Chance that a jitter refresh also rotates one entity.
    #[serde(default = "default_0_3")]
    pub rotation_probability: f64,
    /// Spacing between staggered parks.
    #[serde(default = "default_20_u64")]
    pub park_stagger_secs: u64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            tick_secs: 45,
            low_threshold: 3,
            medium_threshold: 6,
            high_threshold: 10,
            jitter_min_secs: 720,
            jitter_max_secs: 1080,
            rotation_probability: 0.3,
            park_stagger_secs: 20,
        }
    }
}

/// Reconnect and kick backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base reconnect delay.
    #[serde(default = "default_10")]
    pub base_delay_secs: u64,
    /// Random extra delay added to an ordinary reconnect.
    #[serde(default = "default_30_u64")]
    pub jitter_secs: u64,
    /// Shortest settle delay after unparking.
    #[serde(default = "default_10")]
    pub settle_min_secs: u64,
    /// Longest settle delay after unparking.
    #[serde(default = "default_20_u64")]
    pub settle_max_secs: u64,
    /// Consecutive kicks before an entity is halted for good.
    #[serde(default = "default_5_u32")]
    pub max_kicks: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 10,
            jitter_secs: 30,
            settle_min_secs: 10,
            settle_max_secs: 20,
            max_kicks: 5,
        }
    }
}

/// Per-entity memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite file holding memory records.
    #[serde(default = "default_db_path")]
    pub database_path: String,
    /// Recent entries that trigger compaction.
    #[serde(default = "default_12")]
    pub max_recent: usize,
    /// Recent entries kept verbatim after compaction.
    #[serde(default = "default_4_usize")]
    pub keep_after_compact: usize,
    /// Notes shorter than this are not worth keeping.
    #[serde(default = "default_8_usize")]
    pub min_note_chars: usize,
    /// Store and verify CRC-32 checksums.
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            max_recent: 12,
            keep_after_compact: 4,
            min_note_chars: 8,
            checksum_enabled: true,
        }
    }
}

/// Content safety and sensitive topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Lowercase words or phrases that reject a generated reply.
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<String>,
    /// Lowercase keywords that keep a message away from orchestrator dispatch.
    #[serde(default = "default_sensitive")]
    pub sensitive_keywords: Vec<String>,
    /// Chance that a death gets a fixed condolence line.
    #[serde(default = "default_0_5")]
    pub condolence_probability: f64,
    /// Fixed condolence lines.
    #[serde(default = "default_condolences")]
    pub condolence_lines: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocklist: default_blocklist(),
            sensitive_keywords: default_sensitive(),
            condolence_probability: 0.5,
            condolence_lines: default_condolences(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_roster_path() -> String { "personalities.json".to_string() }
fn default_auth() -> String { "offline".to_string() }
fn default_ollama() -> String { "ollama".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_model() -> String { "llama3.1:8b".to_string() }
fn default_db_path() -> String { "presence_memory.db".to_string() }
fn default_blocklist() -> Vec<String> {
    ["as an ai", "language model", "http://", "https://", "discord.gg"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_sensitive() -> Vec<String> {
    ["died", "death", "killed", "was slain", "rip ", "passed away", "deathban"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_condolences() -> Vec<String> {
    ["o7", "rip", "F", "damn, rip", "noooo"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_port() -> u16 { 25565 }
fn default_0_15() -> f64 { 0.15 }
fn default_0_3() -> f64 { 0.3 }
fn default_0_5() -> f64 { 0.5 }
fn default_0_9() -> f32 { 0.9 }
fn default_3_usize() -> usize { 3 }
fn default_4() -> usize { 4 }
fn default_4_usize() -> usize { 4 }
fn default_5() -> u64 { 5 }
fn default_5_u32() -> u32 { 5 }
fn default_6_usize() -> usize { 6 }
fn default_8() -> u64 { 8 }
fn default_8_usize() -> usize { 8 }
fn default_10() -> u64 { 10 }
fn default_10_usize() -> usize { 10 }
fn default_12() -> usize { 12 }
fn default_20() -> usize { 20 }
fn default_20_u64() -> u64 { 20 }
fn default_30() -> usize { 30 }
fn default_30_u64() -> u64 { 30 }
fn default_45() -> u64 { 45 }
fn default_80() -> u32 { 80 }
fn default_90() -> u64 { 90 }
fn default_120() -> u64 { 120 }
fn default_200() -> usize { 200 }
fn default_300() -> u64 { 300 }
fn default_500() -> usize { 500 }
fn default_600() -> u64 { 600 }
fn default_720() -> u64 { 720 }
fn default_800() -> u64 { 800 }
fn default_1080() -> u64 { 1080 }
fn default_1500() -> u64 { 1500 }
fn default_4000() -> u64 { 4000 }
fn default_6000() -> u64 { 6000 }
fn default_15000() -> u64 { 15_000 }
