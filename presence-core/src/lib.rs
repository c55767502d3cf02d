//! # Presence Core Library
//!
//! Transport-agnostic building blocks for simulated chat participants
//! ("presence bots") living in a multiplayer text channel.
//!
//! - [`mention`]: fuzzy entity-mention resolution (exact, substring, bounded edit distance)
//! - [`history`]: bounded shared chat history with a rolling compacted digest
//! - [`rate`]: global sliding rate window and per-entity cooldowns
//! - [`memory`]: per-entity rolling notes, compacted through a [`memory::Summarizer`]
//! - [`persistence`]: whole-record SQLite storage for memory records
//! - [`roster`]: persona roster loading and hot-reload diffing
//! - [`safety`]: pluggable content checks and sensitive-topic detection
//!
//! Nothing here talks to the network; the orchestration crate wires these
//! pieces to a transport and a completion service.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod history;
pub mod memory;
pub mod mention;
pub mod persistence;
pub mod rate;
pub mod roster;
pub mod safety;
pub mod types;

pub use config::PresenceConfig;
pub use error::PresenceError;
pub use memory::{MemoryRecord, MemoryStore};
pub use types::*;
