//! Property-based tests for presence core invariants.
//!
//! Uses `proptest` to check the mention resolver, history bounds and the
//! rate window against random inputs.

use std::time::{Duration, Instant};

use proptest::prelude::*;

use presence_core::config::{HistoryConfig, RateLimitConfig};
use presence_core::history::ChatHistory;
use presence_core::mention::{self, MentionResolver};
use presence_core::rate::RateWindow;
use presence_core::types::{ChatEvent, Persona};

// ---------------------------------------------------------------------------
// Strategy helpers
// ---------------------------------------------------------------------------

fn arb_name() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Z][a-z]{2,8}",
        "[A-Z][a-z]{2,8}_[A-Z][a-z]{2,8}",
        "[a-z]{3,6}[0-9]{1,3}",
    ]
}

fn arb_roster() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_name(), 1..6).prop_map(|mut names| {
        let mut seen = std::collections::HashSet::new();
        names.retain(|n| seen.insert(n.to_lowercase()));
        names
    })
}

fn naive_levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        dp[0][j] = j;
    }
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            dp[i][j] = (dp[i - 1][j - 1] + cost)
                .min(dp[i - 1][j] + 1)
                .min(dp[i][j - 1] + 1);
        }
    }
    dp[a.len()][b.len()]
}

// ---------------------------------------------------------------------------
// Property: a name said verbatim always resolves
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn exact_name_always_resolves(roster in arb_roster(), pick in any::<prop::sample::Index>()) {
        let target = pick.get(&roster).clone();
        let personas: Vec<Persona> = roster.iter().map(Persona::new).collect();
        let got = mention::resolve(&format!("hey {target} come here"), &personas);
        prop_assert!(got.contains(&target), "{target} missing from {got:?}");
    }
}

// ---------------------------------------------------------------------------
// Property: long aliases match without word boundaries
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn long_alias_matches_as_substring(name in "[a-z]{5,10}", prefix in "[xq]{0,4}", suffix in "[xq]{0,4}") {
        let resolver = MentionResolver::new([name.as_str()]);
        let text = format!("{prefix}{name}{suffix}");
        prop_assert_eq!(resolver.resolve(&text), vec![name.as_str()]);
    }
}

// ---------------------------------------------------------------------------
// Property: each entity appears at most once, direct matches first
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn resolution_has_no_duplicates(roster in arb_roster(), text in "[a-zA-Z_ ]{0,40}") {
        let resolver = MentionResolver::new(&roster);
        let got = resolver.resolve(&text);
        let unique: std::collections::HashSet<_> = got.iter().collect();
        prop_assert_eq!(unique.len(), got.len());
        prop_assert!(got.iter().all(|name| roster.iter().any(|r| r == name)));
    }
}

// ---------------------------------------------------------------------------
// Property: bounded distance agrees with full Levenshtein
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn bounded_distance_matches_naive(a in "[a-e]{0,8}", b in "[a-e]{0,8}", max in 0usize..4) {
        let full = naive_levenshtein(&a, &b);
        let bounded = mention::bounded_edit_distance(&a, &b, max);
        if full <= max {
            prop_assert_eq!(bounded, Some(full));
        } else {
            prop_assert_eq!(bounded, None);
        }
    }
}

// ---------------------------------------------------------------------------
// Property: history stays bounded and its digest keeps every folded line
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn history_never_exceeds_capacity(
        capacity in 1usize..30,
        cap_chars in 10usize..200,
        messages in prop::collection::vec("[a-z ]{0,20}", 0..80),
    ) {
        let mut history = ChatHistory::new(&HistoryConfig {
            max_length: capacity,
            summary_max_chars: cap_chars,
        });
        for text in &messages {
            history.push(ChatEvent::now("alex", text.clone()));
            prop_assert!(history.len() <= capacity);
            prop_assert!(history.summary().len() <= cap_chars);
        }
    }

    #[test]
    fn uncapped_digest_covers_all_folded_events(
        capacity in 1usize..10,
        messages in prop::collection::vec("[a-z]{1,8}", 0..40),
    ) {
        let mut history = ChatHistory::new(&HistoryConfig {
            max_length: capacity,
            summary_max_chars: usize::MAX,
        });
        for text in &messages {
            history.push(ChatEvent::now("sam", text.clone()));
        }
        let folded = messages.len().saturating_sub(capacity);
        let expected = messages[..folded]
            .iter()
            .map(|t| format!("sam: {t}"))
            .collect::<Vec<_>>()
            .join(" | ");
        prop_assert_eq!(history.summary(), expected.as_str());
    }
}

// ---------------------------------------------------------------------------
// Property: the rate window never admits more than its cap
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn rate_window_never_exceeds_cap(
        max in 1usize..10,
        window_secs in 1u64..120,
        gaps in prop::collection::vec(0u64..30, 1..100),
    ) {
        let mut window = RateWindow::new(&RateLimitConfig {
            enabled: true,
            window_secs,
            max_messages: max,
        });
        let start = Instant::now();
        let mut now = start;
        for gap in gaps {
            now += Duration::from_secs(gap);
            if !window.is_limited(now) {
                window.record(now);
            }
            prop_assert!(window.count(now) <= max);
        }
    }
}
