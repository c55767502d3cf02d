//! Persona roster loading and hot-reload diffing.
//!
//! The roster file is a JSON array of [`Persona`] objects. Only `username`
//! is required. Index 0 is the primary entity.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::error::{PresenceError, Result};
use crate::types::Persona;

/// Parse and validate a roster from JSON text.
///
/// # Errors
/// [`PresenceError::Roster`] for malformed JSON, an empty roster, empty or
/// duplicate names (compared case-insensitively), or chattiness outside `[0, 1]`.
pub fn parse_roster(json: &str) -> Result<Vec<Persona>> {
    let roster: Vec<Persona> =
        serde_json::from_str(json).map_err(|e| PresenceError::Roster(e.to_string()))?;
    validate_roster(&roster)?;
    Ok(roster)
}

/// Read, parse and validate the roster file.
///
/// # Errors
/// I/O failures plus everything [`parse_roster`] rejects.
pub fn load_roster(path: &Path) -> Result<Vec<Persona>> {
    let content = std::fs::read_to_string(path)?;
    let roster = parse_roster(&content)?;
    info!(path = %path.display(), entities = roster.len(), "Roster loaded");
    Ok(roster)
}

/// Check roster invariants.
///
/// # Errors
/// See [`parse_roster`].
pub fn validate_roster(roster: &[Persona]) -> Result<()> {
    if roster.is_empty() {
        return Err(PresenceError::Roster("roster is empty".into()));
    }
    let mut seen = HashSet::new();
    for persona in roster {
        let name = persona.username.trim();
        if name.is_empty() {
            return Err(PresenceError::Roster("entity with empty username".into()));
        }
        if name != persona.username {
            return Err(PresenceError::Roster(format!(
                "username {:?} has surrounding whitespace",
                persona.username
            )));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(PresenceError::Roster(format!("duplicate username {name}")));
        }
        if !(0.0..=1.0).contains(&persona.chattiness) {
            return Err(PresenceError::Roster(format!(
                "{name}: chattiness {} outside [0, 1]",
                persona.chattiness
            )));
        }
    }
    Ok(())
}

/// Difference between two rosters, by username.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterDiff {
    /// Personas only in the new roster.
    pub added: Vec<Persona>,
    /// Usernames only in the old roster.
    pub removed: Vec<String>,
    /// Personas present in both whose traits changed (new version).
    pub changed: Vec<Persona>,
}

impl RosterDiff {
    /// Whether the two rosters are equivalent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare an old roster to a freshly loaded one.
#[must_use]
pub fn diff_roster(old: &[Persona], new: &[Persona]) -> RosterDiff {
    let mut diff = RosterDiff::default();
    for persona in new {
        match old.iter().find(|p| p.username == persona.username) {
            None => diff.added.push(persona.clone()),
            Some(previous) if previous != persona => diff.changed.push(persona.clone()),
            Some(_) => {}
        }
    }
    for persona in old {
        if !new.iter().any(|p| p.username == persona.username) {
            diff.removed.push(persona.username.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_minimal_and_full_entries() {
        let roster = parse_roster(
            r#"[
                {"username": "Steve_Builder"},
                {"username": "Luna", "personality": "dreamy stargazer", "chattiness": 0.8,
                 "interests": ["astronomy"], "priority": true}
            ]"#,
        )
        .expect("parse");
        assert_eq!(roster.len(), 2);
        assert!(roster[1].priority);
        assert_eq!(roster[1].interests, vec!["astronomy".to_string()]);
    }

    #[test]
    fn rejects_duplicates_ignoring_case() {
        let err = parse_roster(r#"[{"username": "Luna"}, {"username": "luna"}]"#);
        assert!(matches!(err, Err(PresenceError::Roster(_))));
    }

    #[test]
    fn rejects_bad_chattiness_and_empty_names() {
        assert!(parse_roster(r#"[{"username": "Luna", "chattiness": 1.5}]"#).is_err());
        assert!(parse_roster(r#"[{"username": "  "}]"#).is_err());
        assert!(parse_roster("[]").is_err());
        assert!(parse_roster("{not json").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"[{{"username": "Steve_Builder"}}]"#).expect("write");
        let roster = load_roster(file.path()).expect("load");
        assert_eq!(roster[0].username, "Steve_Builder");
    }

    #[test]
    fn diff_reports_added_removed_changed() {
        let old = vec![Persona::new("Steve_Builder"), Persona::new("Luna"), Persona::new("Kai")];
        let new = vec![
            Persona::new("Steve_Builder"),
            Persona::new("Luna").with_personality("grumpy miner"),
            Persona::new("Marlo"),
        ];
        let diff = diff_roster(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].username, "Marlo");
        assert_eq!(diff.removed, vec!["Kai".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].personality, "grumpy miner");
        assert!(diff_roster(&new, &new).is_empty());
    }
}
