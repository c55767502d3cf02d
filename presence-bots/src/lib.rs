//! # Presence Bots
//!
//! Orchestration for simulated chat participants: keeps the right number of
//! them connected, decides who answers what and paces everything so the
//! channel reads like people talking.
//!
//! - [`population`]: per-entity connection state machine, parking and sizing
//! - [`coordinator`]: mention / continuity / orchestrator dispatch, chatter, condolences
//! - [`dialogue`]: reply clean-up, read and typing delays, prompt blocks
//! - [`links`]: conversation links, entity pair caps, chatter anti-repetition
//! - [`memory_bridge`]: memory evaluation and compaction through the completion service
//! - [`events`]: server console and system message parsing
//! - [`transport`] / [`scheduler`]: seams to the connection library and the clock
//! - [`engine`]: the event loop tying it together
//! - [`telemetry`]: logging setup

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod coordinator;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod events;
pub mod links;
pub mod memory_bridge;
pub mod population;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

pub use coordinator::{ConversationCoordinator, DispatchOutcome, DispatchPlan, DispatchReason};
pub use engine::{Collaborators, PresenceEngine};
pub use error::{EngineError, TransportError};
pub use population::{ConnectionState, PopulationController};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use transport::{LoopbackTransport, Transport, TransportEvent, TransportEventKind};
