//! Chat transport contract and an in-process loopback implementation.
//!
//! The transport owns the actual game connections. The engine only asks it
//! to connect, disconnect and send, and learns about everything else from
//! [`TransportEvent`]s delivered on an unbounded channel.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

/// What happened on one entity's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEventKind {
    /// The session is established.
    Login,
    /// A chat line was observed.
    Chat {
        /// Display name of the speaker.
        sender: String,
        /// Message text.
        text: String,
    },
    /// Someone joined the server.
    PlayerJoined {
        /// Display name.
        name: String,
    },
    /// Someone left the server.
    PlayerLeft {
        /// Display name.
        name: String,
    },
    /// Server-generated text (deaths, advancements, join notices).
    SystemMessage {
        /// Raw message.
        text: String,
    },
    /// The server kicked this entity. An `Ended` event follows.
    Kicked {
        /// Kick reason.
        reason: String,
    },
    /// The session is over.
    Ended {
        /// Why it ended.
        reason: String,
    },
}

/// An event observed on the connection of `entity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEvent {
    /// Simulated entity whose connection saw the event.
    pub entity: String,
    /// What happened.
    pub kind: TransportEventKind,
}

impl TransportEvent {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(entity: impl Into<String>, kind: TransportEventKind) -> Self {
        Self {
            entity: entity.into(),
            kind,
        }
    }
}

/// Sending half of the event channel handed to transports.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving half consumed by the engine.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a transport event channel.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Connection library seam.
///
/// Calls must not block: `connect` starts a session that is acknowledged
/// later by a `Login` event, and `disconnect` is acknowledged by `Ended`.
pub trait Transport: Send + Sync {
    /// Begin a session for `username`.
    ///
    /// # Errors
    /// [`TransportError::ConnectFailed`] when the attempt cannot even start.
    fn connect(&self, username: &str) -> Result<(), TransportError>;

    /// End the session for `username`.
    ///
    /// # Errors
    /// [`TransportError::NotConnected`] if there is no session.
    fn disconnect(&self, username: &str) -> Result<(), TransportError>;

    /// Send one chat line as `username`. Best effort.
    ///
    /// # Errors
    /// [`TransportError::NotConnected`] or [`TransportError::SendFailed`].
    fn send(&self, username: &str, text: &str) -> Result<(), TransportError>;
}

/// Send newline-delimited text as sequential lines, `line_delay` apart.
///
/// Blank lines are skipped. Returns the number of lines sent.
///
/// # Errors
/// The first failing send; later lines are not attempted.
pub async fn send_lines(
    transport: &dyn Transport,
    entity: &str,
    text: &str,
    line_delay: Duration,
) -> Result<usize, TransportError> {
    let mut sent = 0;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if sent > 0 {
            tokio::time::sleep(line_delay).await;
        }
        transport.send(entity, line)?;
        sent += 1;
    }
    Ok(sent)
}

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

/// In-process transport: sessions succeed instantly, sends are recorded and
/// echoed back as chat seen by the listener entity.
///
/// Used for offline runs and tests.
#[derive(Debug)]
pub struct LoopbackTransport {
    events: EventSender,
    listener: Mutex<Option<String>>,
    connected: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, String)>>,
    connect_calls: Mutex<Vec<String>>,
    auto_login: bool,
}

impl LoopbackTransport {
    /// Create a loopback that emits `Login` as soon as `connect` is called.
    #[must_use]
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            listener: Mutex::new(None),
            connected: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            connect_calls: Mutex::new(Vec::new()),
            auto_login: true,
        }
    }

    /// Leave sessions pending until [`LoopbackTransport::login`] is called.
    #[must_use]
    pub fn manual_login(mut self) -> Self {
        self.auto_login = false;
        self
    }

    /// Entity whose connection observes global chat (the primary).
    #[must_use]
    pub fn with_listener(self, entity: impl Into<String>) -> Self {
        *self.listener.lock() = Some(entity.into());
        self
    }

    fn emit(&self, entity: &str, kind: TransportEventKind) {
        // The engine may already be gone during shutdown.
        let _ = self.events.send(TransportEvent::new(entity, kind));
    }

    fn listener(&self) -> Option<String> {
        self.listener.lock().clone()
    }

    /// Acknowledge a pending session.
    pub fn login(&self, entity: &str) {
        self.connected.lock().insert(entity.to_string());
        self.emit(entity, TransportEventKind::Login);
    }

    /// Kick an entity: `Kicked` followed by `Ended`.
    pub fn kick(&self, entity: &str, reason: &str) {
        self.connected.lock().remove(entity);
        self.emit(entity, TransportEventKind::Kicked { reason: reason.to_string() });
        self.emit(entity, TransportEventKind::Ended { reason: "kicked".to_string() });
    }

    /// Drop a session without a kick.
    pub fn drop_session(&self, entity: &str, reason: &str) {
        self.connected.lock().remove(entity);
        self.emit(entity, TransportEventKind::Ended { reason: reason.to_string() });
    }

    /// Inject a chat line from a real participant, seen by the listener.
    pub fn say(&self, sender: &str, text: &str) {
        if let Some(listener) = self.listener() {
            self.emit(
                &listener,
                TransportEventKind::Chat {
                    sender: sender.to_string(),
                    text: text.to_string(),
                },
            );
        }
    }

    /// Inject an arbitrary event.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Every line sent so far, as `(entity, text)`.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// Lines sent by one entity.
    #[must_use]
    pub fn sent_by(&self, entity: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Entities passed to `connect`, in call order.
    #[must_use]
    pub fn connect_calls(&self) -> Vec<String> {
        self.connect_calls.lock().clone()
    }

    /// Whether the loopback holds a session for `entity`.
    #[must_use]
    pub fn is_connected(&self, entity: &str) -> bool {
        self.connected.lock().contains(entity)
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self, username: &str) -> Result<(), TransportError> {
        self.connect_calls.lock().push(username.to_string());
        debug!(entity = username, "Loopback connect");
        if self.auto_login {
            self.login(username);
        }
        Ok(())
    }

    fn disconnect(&self, username: &str) -> Result<(), TransportError> {
        if !self.connected.lock().remove(username) {
            return Err(TransportError::NotConnected(username.to_string()));
        }
        self.emit(username, TransportEventKind::Ended { reason: "disconnected".to_string() });
        Ok(())
    }

    fn send(&self, username: &str, text: &str) -> Result<(), TransportError> {
        if !self.is_connected(username) {
            return Err(TransportError::NotConnected(username.to_string()));
        }
        self.sent.lock().push((username.to_string(), text.to_string()));
        if let Some(listener) = self.listener() {
            if self.is_connected(&listener) {
                self.emit(
                    &listener,
                    TransportEventKind::Chat {
                        sender: username.to_string(),
                        text: text.to_string(),
                    },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_emits_login_and_send_echoes() {
        let (tx, mut rx) = event_channel();
        let transport = LoopbackTransport::new(tx).with_listener("Steve_Builder");
        transport.connect("Steve_Builder").expect("connect");
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::new("Steve_Builder", TransportEventKind::Login))
        );

        transport.send("Steve_Builder", "hello").expect("send");
        assert_eq!(
            rx.recv().await.map(|e| e.kind),
            Some(TransportEventKind::Chat {
                sender: "Steve_Builder".into(),
                text: "hello".into()
            })
        );
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let (tx, _rx) = event_channel();
        let transport = LoopbackTransport::new(tx);
        assert!(matches!(
            transport.send("Luna", "hi"),
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_lines_spaces_lines_and_skips_blanks() {
        let (tx, _rx) = event_channel();
        let transport = LoopbackTransport::new(tx);
        transport.connect("Luna").expect("connect");

        let start = tokio::time::Instant::now();
        let sent = send_lines(&transport, "Luna", "first\n\n second \nthird", Duration::from_millis(800))
            .await
            .expect("send");
        assert_eq!(sent, 3);
        assert_eq!(transport.sent_by("Luna"), vec!["first", "second", "third"]);
        assert_eq!(start.elapsed(), Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn kick_emits_kicked_then_ended() {
        let (tx, mut rx) = event_channel();
        let transport = LoopbackTransport::new(tx);
        transport.connect("Luna").expect("connect");
        let _login = rx.recv().await;
        transport.kick("Luna", "spam");
        assert!(matches!(rx.recv().await.map(|e| e.kind), Some(TransportEventKind::Kicked { .. })));
        assert!(matches!(rx.recv().await.map(|e| e.kind), Some(TransportEventKind::Ended { .. })));
        assert!(!transport.is_connected("Luna"));
    }
}
