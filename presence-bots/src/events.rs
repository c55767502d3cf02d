//! Server event ingestion.
//!
//! The primary entity's connection (or the server console) is the only
//! source of global events. Console lines look like
//!
//! ```text
//! [14:02:11] [Server thread/INFO]: [Not Secure] Alex » anyone up for the nether?
//! [14:02:40] [Server thread/INFO]: Alex joined the game
//! [14:05:03] [Server thread/INFO]: ☠ Alex was slain by Zombie (Extra: World:world, X:12, Y:64, Z:-80)
//! ```
//!
//! Coordinates in death lines are never kept.

use chrono::NaiveTime;
use serde::Serialize;

/// Something that happened on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Public chat line.
    Chat {
        /// Speaker.
        sender: String,
        /// Message text.
        text: String,
    },
    /// A player joined.
    Joined {
        /// Player name.
        name: String,
    },
    /// A player left (including hardcore game-over disconnects).
    Left {
        /// Player name.
        name: String,
    },
    /// A player died.
    Death {
        /// Who died.
        player: String,
        /// Death message without the name, e.g. "was slain by Zombie".
        cause: String,
    },
    /// A player earned an advancement.
    Advancement {
        /// Player name.
        player: String,
        /// Advancement title.
        title: String,
    },
}

impl ServerEvent {
    /// Player the event is about.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::Chat { sender, .. } => sender,
            Self::Joined { name } | Self::Left { name } => name,
            Self::Death { player, .. } | Self::Advancement { player, .. } => player,
        }
    }
}

/// The `[HH:MM:SS] [Thread/LEVEL]: message` envelope of a console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEnvelope<'a> {
    /// Wall-clock time of day.
    pub time: NaiveTime,
    /// Emitting thread.
    pub thread: &'a str,
    /// Log level.
    pub level: &'a str,
    /// Payload.
    pub message: &'a str,
}

/// Split a console line into its envelope.
#[must_use]
pub fn parse_envelope(line: &str) -> Option<LogEnvelope<'_>> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix('[')?;
    let (time, rest) = rest.split_once("] [")?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    let (tag, message) = rest.split_once("]: ")?;
    let (thread, level) = tag.rsplit_once('/')?;
    if thread.is_empty() || level.is_empty() || message.is_empty() {
        return None;
    }
    Some(LogEnvelope {
        time,
        thread,
        level,
        message,
    })
}

/// Parse one console line into a server event.
#[must_use]
pub fn parse_server_line(line: &str) -> Option<ServerEvent> {
    parse_system_message(parse_envelope(line)?.message)
}

fn single_name(s: &str) -> Option<String> {
    (!s.is_empty() && !s.contains(char::is_whitespace)).then(|| s.to_string())
}

/// Parse a bare server message (no envelope), as relayed by the transport.
#[must_use]
pub fn parse_system_message(message: &str) -> Option<ServerEvent> {
    let message = message.trim();

    if let Some(rest) = message.strip_prefix("☠ ") {
        return parse_death(rest);
    }
    if let Some(name) = message.strip_suffix(" joined the game") {
        return single_name(name).map(|name| ServerEvent::Joined { name });
    }
    if let Some(name) = message.strip_suffix(" left the game") {
        return single_name(name).map(|name| ServerEvent::Left { name });
    }
    if let Some(head) = message.strip_suffix(" lost connection: Game Over!") {
        let name = head.split(" (").next().unwrap_or(head);
        return single_name(name).map(|name| ServerEvent::Left { name });
    }
    if let Some((player, rest)) = message.split_once(" has made the advancement [") {
        let title = rest.strip_suffix(']')?;
        return single_name(player).map(|player| ServerEvent::Advancement {
            player,
            title: title.to_string(),
        });
    }

    let chat = message.strip_prefix("[Not Secure] ").unwrap_or(message);
    let (sender, text) = chat.split_once(" » ")?;
    // Anticheat notices share the chat shape.
    if sender == "Grim" || text.trim().is_empty() {
        return None;
    }
    single_name(sender).map(|sender| ServerEvent::Chat {
        sender,
        text: text.trim().to_string(),
    })
}

fn parse_death(rest: &str) -> Option<ServerEvent> {
    let body = match rest.rfind(" (Extra: ") {
        Some(index) if rest.ends_with(')') => &rest[..index],
        _ => rest,
    };
    let (player, cause) = body.split_once(' ')?;
    let cause = cause.trim();
    if cause.is_empty() {
        return None;
    }
    single_name(player).map(|player| ServerEvent::Death {
        player,
        cause: cause.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_fields() {
        let env = parse_envelope("[14:02:11] [Server thread/INFO]: Alex joined the game")
            .expect("envelope");
        assert_eq!(env.time, NaiveTime::from_hms_opt(14, 2, 11).expect("time"));
        assert_eq!(env.thread, "Server thread");
        assert_eq!(env.level, "INFO");
        assert_eq!(env.message, "Alex joined the game");
        assert!(parse_envelope("garbage").is_none());
    }

    #[test]
    fn chat_with_and_without_secure_prefix() {
        assert_eq!(
            parse_server_line("[14:02:11] [Server thread/INFO]: [Not Secure] Alex » anyone up?"),
            Some(ServerEvent::Chat {
                sender: "Alex".into(),
                text: "anyone up?".into()
            })
        );
        assert_eq!(
            parse_system_message("Steve_Builder » on my way"),
            Some(ServerEvent::Chat {
                sender: "Steve_Builder".into(),
                text: "on my way".into()
            })
        );
    }

    #[test]
    fn anticheat_lines_are_ignored() {
        assert_eq!(parse_system_message("Grim » Alex failed Timer"), None);
    }

    #[test]
    fn join_leave_and_game_over() {
        assert_eq!(
            parse_system_message("Alex joined the game"),
            Some(ServerEvent::Joined { name: "Alex".into() })
        );
        assert_eq!(
            parse_system_message("Alex left the game"),
            Some(ServerEvent::Left { name: "Alex".into() })
        );
        assert_eq!(
            parse_system_message("Alex (/10.0.0.5:51234) lost connection: Game Over!"),
            Some(ServerEvent::Left { name: "Alex".into() })
        );
    }

    #[test]
    fn death_strips_coordinates() {
        let event = parse_server_line(
            "[14:05:03] [Server thread/INFO]: ☠ Alex was slain by Zombie (Extra: World:world, X:12, Y:64, Z:-80)",
        );
        assert_eq!(
            event,
            Some(ServerEvent::Death {
                player: "Alex".into(),
                cause: "was slain by Zombie".into()
            })
        );
        assert_eq!(
            parse_system_message("☠ Alex fell from a high place"),
            Some(ServerEvent::Death {
                player: "Alex".into(),
                cause: "fell from a high place".into()
            })
        );
    }

    #[test]
    fn advancement() {
        assert_eq!(
            parse_system_message("Alex has made the advancement [Stone Age]"),
            Some(ServerEvent::Advancement {
                player: "Alex".into(),
                title: "Stone Age".into()
            })
        );
    }

    #[test]
    fn unrelated_lines_are_none() {
        assert_eq!(parse_system_message("Saving the game"), None);
        assert_eq!(parse_system_message("two words » not a name"), None);
    }
}
