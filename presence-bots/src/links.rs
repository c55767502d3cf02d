//! Short-lived conversational bookkeeping.
//!
//! - [`ConversationLinks`]: which entity last answered a given player.
//! - [`PairExchanges`]: windowed count of entity-to-entity exchanges per
//!   unordered pair, so two entities cannot loop on each other forever.
//! - [`ChatterRing`]: recent unprompted remarks, used to avoid repeating a
//!   topic.
//!
//! Everything takes the current instant as an argument.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Conversation links
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Link {
    entity: String,
    at: Instant,
}

/// `player → (entity, timestamp)` with a time-to-live.
///
/// Player names are matched case-insensitively.
#[derive(Debug, Clone)]
pub struct ConversationLinks {
    ttl: Duration,
    links: HashMap<String, Link>,
}

impl ConversationLinks {
    /// Create an empty link table.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            links: HashMap::new(),
        }
    }

    /// Record that `entity` just replied to `player`.
    pub fn set(&mut self, player: &str, entity: &str, now: Instant) {
        self.links.insert(
            player.to_lowercase(),
            Link {
                entity: entity.to_string(),
                at: now,
            },
        );
    }

    /// The linked entity, if the link is still live.
    #[must_use]
    pub fn get(&self, player: &str, now: Instant) -> Option<&str> {
        self.links
            .get(&player.to_lowercase())
            .filter(|link| now.saturating_duration_since(link.at) < self.ttl)
            .map(|link| link.entity.as_str())
    }

    /// Drop every link pointing at `entity` (it left the roster).
    pub fn forget_entity(&mut self, entity: &str) {
        self.links.retain(|_, link| link.entity != entity);
    }

    /// Drop expired links.
    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.links
            .retain(|_, link| now.saturating_duration_since(link.at) < ttl);
    }

    /// Number of stored links, expired ones included until pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no links are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Pair exchanges
// ---------------------------------------------------------------------------

/// Windowed, capped exchange counter keyed by unordered entity pair.
#[derive(Debug, Clone)]
pub struct PairExchanges {
    window: Duration,
    max: usize,
    pairs: HashMap<(String, String), VecDeque<Instant>>,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    if a <= b { (a, b) } else { (b, a) }
}

impl PairExchanges {
    /// Allow `max` exchanges per pair inside `window`.
    #[must_use]
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            pairs: HashMap::new(),
        }
    }

    /// Exchanges between `a` and `b` still inside the window.
    #[must_use]
    pub fn count(&self, a: &str, b: &str, now: Instant) -> usize {
        self.pairs.get(&pair_key(a, b)).map_or(0, |times| {
            times
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < self.window)
                .count()
        })
    }

    /// Whether `a` and `b` may exchange another message.
    #[must_use]
    pub fn allows(&self, a: &str, b: &str, now: Instant) -> bool {
        self.count(a, b, now) < self.max
    }

    /// Record one exchange.
    pub fn record(&mut self, a: &str, b: &str, now: Instant) {
        let window = self.window;
        let times = self.pairs.entry(pair_key(a, b)).or_default();
        while times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            times.pop_front();
        }
        times.push_back(now);
    }

    /// Drop every pair involving `entity`.
    pub fn forget_entity(&mut self, entity: &str) {
        let entity = entity.to_lowercase();
        self.pairs.retain(|(a, b), _| *a != entity && *b != entity);
    }
}

// ---------------------------------------------------------------------------
// Chatter ring
// ---------------------------------------------------------------------------

/// Token overlap above which two remarks count as the same topic.
const REPEAT_THRESHOLD: f64 = 0.6;

/// Lowercased content words (three characters or more).
fn content_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of content words, in `[0, 1]`.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (content_tokens(a), content_tokens(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = shared as f64 / union as f64;
    ratio
}

/// Bounded buffer of recent chatter lines.
#[derive(Debug, Clone)]
pub struct ChatterRing {
    capacity: usize,
    lines: VecDeque<String>,
}

impl ChatterRing {
    /// Keep at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Remember a line, evicting the oldest when full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Whether `candidate` is too close to something said recently.
    #[must_use]
    pub fn is_repeat(&self, candidate: &str) -> bool {
        self.lines
            .iter()
            .any(|line| similarity(line, candidate) >= REPEAT_THRESHOLD)
    }

    /// Recent lines joined for the "avoid these topics" prompt slot.
    #[must_use]
    pub fn topics(&self) -> String {
        if self.lines.is_empty() {
            return "none".to_string();
        }
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("; ")
    }

    /// Number of remembered lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
