//! # presence-llm: completion layer for presence bots
//!
//! Provides a unified interface to the text-generation service:
//!   - **Ollama** (`/api/chat`, local, default)
//!   - **OpenAI-compatible API** (`/v1/chat/completions`)
//!   - **None** (every call fails, exercising each caller's fallback)
//!
//! All completions in the engine go through the [`Completion`] trait, so
//! tests can swap in scripted fakes. The service is unreliable by contract:
//! callers treat any error as "no output" and never retry synchronously.
//!
//! Prompt templates live in [`prompt`]; lenient readers for the structured
//! answers (orchestrator picks, memory verdicts) live in [`parse`].

pub mod client;
pub mod error;
pub mod parse;
pub mod prompt;
pub mod types;

pub use client::{Completion, LlmClient, LlmProvider};
pub use error::LlmError;
pub use types::{ChatRole, ChatTurn, CompletionRequest, CompletionResponse, MemoryVerdict, OrchestratorPick};
