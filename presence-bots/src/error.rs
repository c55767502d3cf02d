//! Error types for the orchestration layer.

use thiserror::Error;

/// Failures reported by a chat transport.
///
/// Every one of these is recoverable: the population controller turns
/// connection failures into reconnect timers and the coordinator turns send
/// failures into "no reply".
#[derive(Debug, Error)]
pub enum TransportError {
    /// The entity has no live session.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// The transport refused or lost the message.
    #[error("send failed for {entity}: {reason}")]
    SendFailed {
        /// Sending entity.
        entity: String,
        /// Transport-provided reason.
        reason: String,
    },

    /// A session could not be started.
    #[error("connect failed for {entity}: {reason}")]
    ConnectFailed {
        /// Entity that tried to connect.
        entity: String,
        /// Transport-provided reason.
        reason: String,
    },
}

/// Startup failures of the engine. Nothing after startup returns these.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration, roster or database problem.
    #[error(transparent)]
    Core(#[from] presence_core::PresenceError),

    /// Completion client or prompt templates could not be set up.
    #[error(transparent)]
    Llm(#[from] presence_llm::LlmError),

    /// No tokio runtime to schedule timers on.
    #[error("engine must be started inside a tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}
