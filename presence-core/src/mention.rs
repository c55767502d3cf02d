//! Mention resolution: "Who did they just talk to?"
//!
//! Matches free chat text against the roster using three tiers, cheapest
//! first:
//!   1. exact token match against any alias of an entity name
//!   2. substring match for aliases of five or more characters
//!   3. bounded Levenshtein distance (1 for short aliases, 2 otherwise)
//!
//! This is string similarity only. Ambiguous aliases are passed through:
//! if two entities share an alias, both resolve.

use crate::types::Persona;

/// Separators treated as word boundaries inside a display name.
const NAME_SEPARATORS: &[char] = &['_', '-', '.', ' '];

/// Aliases shorter than this are never derived from segments or stripping.
const MIN_ALIAS_LEN: usize = 3;

/// Aliases at least this long may match as raw substrings.
const SUBSTRING_MIN_LEN: usize = 5;

/// Precomputed aliases for a roster, ready to resolve many messages.
#[derive(Debug, Clone)]
pub struct MentionResolver {
    entries: Vec<AliasEntry>,
}

#[derive(Debug, Clone)]
struct AliasEntry {
    name: String,
    aliases: Vec<String>,
}

/// How an entity was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Direct,
    Fuzzy(usize),
}

impl MentionResolver {
    /// Build a resolver over a list of display names, in roster order.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = names
            .into_iter()
            .map(|name| AliasEntry {
                name: name.as_ref().to_string(),
                aliases: aliases(name.as_ref()),
            })
            .collect();
        Self { entries }
    }

    /// Build a resolver over a persona roster.
    #[must_use]
    pub fn from_personas(roster: &[Persona]) -> Self {
        Self::new(roster.iter().map(|p| p.username.as_str()))
    }

    /// Every entity addressed by `text`.
    ///
    /// Exact and substring matches come first in roster order, followed by
    /// fuzzy-only matches by ascending distance (ties in roster order).
    #[must_use]
    pub fn resolve(&self, text: &str) -> Vec<&str> {
        let lowered = text.to_lowercase();
        let tokens = tokenize(&lowered);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut direct = Vec::new();
        let mut fuzzy: Vec<(usize, usize)> = Vec::new();

        for (index, entry) in self.entries.iter().enumerate() {
            match match_entry(entry, &lowered, &tokens) {
                Some(MatchKind::Direct) => direct.push(index),
                Some(MatchKind::Fuzzy(distance)) => fuzzy.push((distance, index)),
                None => {}
            }
        }

        fuzzy.sort_unstable();
        direct
            .into_iter()
            .chain(fuzzy.into_iter().map(|(_, index)| index))
            .map(|index| self.entries[index].name.as_str())
            .collect()
    }

    /// The single best match, if any.
    #[must_use]
    pub fn resolve_first(&self, text: &str) -> Option<&str> {
        self.resolve(text).into_iter().next()
    }

    /// Number of entities known to the resolver.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the resolver has no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve mentions against a persona roster in one shot.
#[must_use]
pub fn resolve(text: &str, roster: &[Persona]) -> Vec<String> {
    MentionResolver::from_personas(roster)
        .resolve(text)
        .into_iter()
        .map(ToString::to_string)
        .collect()
}

/// Head of [`resolve`].
#[must_use]
pub fn resolve_first(text: &str, roster: &[Persona]) -> Option<String> {
    resolve(text, roster).into_iter().next()
}

fn match_entry(entry: &AliasEntry, lowered: &str, tokens: &[&str]) -> Option<MatchKind> {
    let mut best: Option<usize> = None;

    for alias in &entry.aliases {
        if tokens.iter().any(|t| *t == alias.as_str()) {
            return Some(MatchKind::Direct);
        }
        let alias_len = alias.chars().count();
        if alias_len >= SUBSTRING_MIN_LEN && lowered.contains(alias.as_str()) {
            return Some(MatchKind::Direct);
        }

        let max = if alias_len <= 4 { 1 } else { 2 };
        for token in tokens {
            if let Some(d) = bounded_edit_distance(alias, token, max) {
                best = Some(best.map_or(d, |b| b.min(d)));
            }
        }
    }

    best.map(MatchKind::Fuzzy)
}

/// Lowercased tokens of at least two characters, split on whitespace and
/// punctuation (underscores included).
///
/// A full display name like `steve_builder` still matches through the
/// substring tier.
#[must_use]
pub fn tokenize(lowered: &str) -> Vec<&str> {
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .collect()
}

/// Derive the alias set for a display name, deduplicated, most specific first.
#[must_use]
pub fn aliases(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    let mut push = |alias: String| {
        if !alias.is_empty() && !out.contains(&alias) {
            out.push(alias);
        }
    };

    push(lower.clone());
    push(lower.chars().filter(|c| !NAME_SEPARATORS.contains(c)).collect());

    for segment in lower.split(NAME_SEPARATORS) {
        if segment.chars().count() >= MIN_ALIAS_LEN {
            push(segment.to_string());
        }
    }

    let stripped = strip_filler(name);
    if stripped.chars().count() >= MIN_ALIAS_LEN {
        push(stripped);
    }

    out
}

/// Remove padding around a name: separators plus a leading or trailing run
/// of one repeated character (`xxSteve`, `Steve__`, `000steve000`).
///
/// Letters in a name double up naturally (`Aaron`, `Scott`), so a run of
/// letters only counts as padding when it is three or more long or when it
/// sits across a case change from the rest of the name (`xxMiner`,
/// `SteveXX`).
fn strip_filler(name: &str) -> String {
    let trimmed = name.trim_matches(NAME_SEPARATORS);
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    let mut start = 0;
    let lead_run = chars.iter().take_while(|c| **c == chars[0]).count();
    if lead_run < chars.len() && is_padding(chars[0], lead_run, chars[lead_run]) {
        start = lead_run;
    }

    let mut end = chars.len();
    let last = chars[end - 1];
    let tail_run = chars.iter().rev().take_while(|c| **c == last).count();
    if end - tail_run > start && is_padding(last, tail_run, chars[end - tail_run - 1]) {
        end -= tail_run;
    }

    let inner: String = chars[start..end].iter().collect();
    inner.trim_matches(NAME_SEPARATORS).to_lowercase()
}

/// Whether a run of `len` copies of `c`, next to `neighbour`, is padding.
fn is_padding(c: char, len: usize, neighbour: char) -> bool {
    if len < 2 {
        return false;
    }
    if !c.is_alphabetic() {
        return true;
    }
    len >= 3 || (neighbour.is_alphabetic() && c.is_lowercase() != neighbour.is_lowercase())
}

/// Levenshtein distance between `a` and `b`, or `None` once it must exceed `max`.
///
/// Rows whose minimum already exceeds `max` cannot improve, so the scan
/// stops there.
#[must_use]
pub fn bounded_edit_distance(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    if a.is_empty() || b.is_empty() {
        let d = a.len().max(b.len());
        return (d <= max).then_some(d);
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let d = prev[b.len()];
    (d <= max).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(names: &[&str]) -> Vec<Persona> {
        names.iter().map(|n| Persona::new(*n)).collect()
    }

    #[test]
    fn alias_set_for_underscored_name() {
        let a = aliases("Steve_Builder");
        assert_eq!(a[0], "steve_builder");
        assert!(a.contains(&"stevebuilder".to_string()));
        assert!(a.contains(&"steve".to_string()));
        assert!(a.contains(&"builder".to_string()));
    }

    #[test]
    fn alias_strips_padding_runs() {
        assert!(aliases("xxMiner").contains(&"miner".to_string()));
        assert!(aliases("__Ghost__").contains(&"ghost".to_string()));
        // Short segments are not aliases on their own.
        assert!(!aliases("Al_Smith").contains(&"al".to_string()));
    }

    #[test]
    fn doubled_letters_in_real_names_are_not_padding() {
        assert_eq!(aliases("Aaron"), vec!["aaron".to_string()]);
        assert_eq!(aliases("Scott"), vec!["scott".to_string()]);
        assert!(aliases("000steve000").contains(&"steve".to_string()));
        assert!(aliases("SteveXX").contains(&"steve".to_string()));
        assert!(aliases("zzzLuna").contains(&"luna".to_string()));

        let r = roster(&["Aaron", "Scott", "Ollie"]);
        assert!(resolve("im on it", &r).is_empty());
        assert!(resolve("so what now", &r).is_empty());
        assert_eq!(resolve("scott you there", &r), vec!["Scott"]);
    }

    #[test]
    fn exact_name_resolves() {
        let r = roster(&["Steve_Builder", "Luna"]);
        assert_eq!(resolve("hey Steve_Builder come here", &r), vec!["Steve_Builder"]);
        assert_eq!(resolve("luna?", &r), vec!["Luna"]);
    }

    #[test]
    fn underscores_split_tokens() {
        assert_eq!(tokenize("hey steve_builder, ok?"), vec!["hey", "steve", "builder", "ok"]);
        let r = roster(&["Kai_Lee"]);
        // "kai_lee" is split into "kai" and "lee", and "kai" is a segment alias.
        assert_eq!(resolve("yo kai_lee", &r), vec!["Kai_Lee"]);
    }

    #[test]
    fn segment_resolves() {
        let r = roster(&["Steve_Builder"]);
        assert_eq!(resolve("steve come help", &r), vec!["Steve_Builder"]);
    }

    #[test]
    fn substring_without_word_boundary() {
        let r = roster(&["Steve_Builder"]);
        assert_eq!(resolve("ohhhbuilderrr where are you", &r), vec!["Steve_Builder"]);
    }

    #[test]
    fn short_alias_needs_token_match() {
        let r = roster(&["Ava"]);
        // "ava" is short: no substring matching inside "savannah".
        assert!(resolve("we built a savannah base", &r).is_empty());
        assert_eq!(resolve("ava you there", &r), vec!["Ava"]);
    }

    #[test]
    fn typo_within_two_edits() {
        let r = roster(&["Steve_Builder"]);
        assert_eq!(
            bounded_edit_distance("stevebilder", "stevebuilder", 2),
            Some(1)
        );
        assert_eq!(resolve("stevebilder you on?", &r), vec!["Steve_Builder"]);
    }

    #[test]
    fn unrelated_long_token_does_not_match() {
        let r = roster(&["Steve_Builder", "Luna_Moth"]);
        assert!(resolve("qzwxkjvbnmpl", &r).is_empty());
    }

    #[test]
    fn direct_before_fuzzy_then_by_distance() {
        let r = roster(&["Marlo", "Bramble", "Kestrel"]);
        // "kestrl" is one edit away, "brmbl" two, "marlo" exact.
        let got = resolve("brmbl kestrl marlo", &r);
        assert_eq!(got, vec!["Marlo", "Kestrel", "Bramble"]);
    }

    #[test]
    fn shared_alias_resolves_both() {
        let r = roster(&["Steve_Builder", "Steve_Miner"]);
        let got = resolve("steve!", &r);
        assert_eq!(got, vec!["Steve_Builder", "Steve_Miner"]);
    }

    #[test]
    fn empty_text_matches_nothing() {
        let r = roster(&["Steve_Builder"]);
        assert!(resolve("", &r).is_empty());
        assert!(resolve_first("   ", &r).is_none());
    }

    #[test]
    fn bounded_distance_bails_early() {
        assert_eq!(bounded_edit_distance("kitten", "sitting", 3), Some(3));
        assert_eq!(bounded_edit_distance("kitten", "sitting", 2), None);
        assert_eq!(bounded_edit_distance("abc", "abc", 0), Some(0));
    }
}
