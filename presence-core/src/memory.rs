//! Per-entity memory: a rolling summary plus a short buffer of recent notes.
//!
//! The in-process cache is the source of truth for the session. Every write
//! is pushed through to the [`RecordStore`], but a failed write only gets a
//! warning; the next natural write carries the full record again.
//!
//! Once `recent` reaches `max_recent` entries, everything except the newest
//! `keep_after_compact` is folded into `summary` by a [`Summarizer`]. A failed
//! summarisation leaves the record untouched, so the next append retries it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::persistence::RecordStore;

/// What one entity remembers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Condensed digest of everything compacted so far.
    #[serde(default)]
    pub summary: String,
    /// Newest notes, oldest first.
    #[serde(default)]
    pub recent: Vec<String>,
}

impl MemoryRecord {
    /// Whether the record holds nothing worth rendering.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty() && self.recent.is_empty()
    }

    /// Render for prompt injection: the summary, then one bullet per note.
    ///
    /// Returns an empty string when there is nothing to say, which callers
    /// treat as "omit this block".
    #[must_use]
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        let summary = self.summary.trim();
        if !summary.is_empty() {
            parts.push(summary.to_string());
        }
        if !self.recent.is_empty() {
            parts.push(
                self.recent
                    .iter()
                    .map(|note| format!("- {note}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        parts.join("\n")
    }
}

/// Condenses old notes into a new summary. Implemented on top of the
/// completion service in the orchestration crate.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a replacement summary covering `existing_summary` and `entries`.
    ///
    /// # Errors
    /// A human-readable reason; the caller logs it and keeps the record as is.
    async fn summarize(
        &self,
        entity: &str,
        existing_summary: &str,
        entries: &[String],
    ) -> Result<String, String>;
}

/// Result of one [`MemoryStore::compact`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Older notes were folded into the summary.
    Compacted {
        /// Number of notes removed from `recent`.
        folded: usize,
    },
    /// Nothing old enough to fold.
    NotNeeded,
    /// Another compaction of the same entity is already running.
    InProgress,
    /// The summarizer failed; the record is unchanged.
    Failed,
}

/// Removes the entity from the in-progress set however compaction exits.
struct CompactGuard<'a> {
    set: &'a DashSet<String>,
    entity: String,
}

impl Drop for CompactGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.entity);
    }
}

/// Cached, persisted, self-compacting memory for every entity.
pub struct MemoryStore {
    records: DashMap<String, MemoryRecord>,
    compacting: DashSet<String>,
    store: Arc<dyn RecordStore>,
    summarizer: Arc<dyn Summarizer>,
    max_recent: usize,
    keep_after_compact: usize,
    min_note_chars: usize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("cached", &self.records.len())
            .field("max_recent", &self.max_recent)
            .field("keep_after_compact", &self.keep_after_compact)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a store over the given persistence and summarizer.
    #[must_use]
    pub fn new(
        config: &MemoryConfig,
        store: Arc<dyn RecordStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            records: DashMap::new(),
            compacting: DashSet::new(),
            store,
            summarizer,
            max_recent: config.max_recent.max(1),
            keep_after_compact: config.keep_after_compact.min(config.max_recent.saturating_sub(1)),
            min_note_chars: config.min_note_chars,
        }
    }

    /// Make sure the entity's record is cached, loading it on first use.
    fn ensure_loaded(&self, entity: &str) {
        if self.records.contains_key(entity) {
            return;
        }
        let loaded = match self.store.load(entity) {
            Ok(Some(record)) => record,
            Ok(None) => MemoryRecord::default(),
            Err(e) => {
                warn!(entity, error = %e, "Memory load failed, starting empty");
                MemoryRecord::default()
            }
        };
        self.records.entry(entity.to_string()).or_insert(loaded);
    }

    fn persist(&self, entity: &str) {
        let Some(snapshot) = self.records.get(entity).map(|r| r.clone()) else {
            return;
        };
        if let Err(e) = self.store.save(entity, &snapshot) {
            warn!(entity, error = %e, "Memory write failed, keeping cached copy");
        }
    }

    /// Whether a candidate note is long enough to be worth an append.
    #[must_use]
    pub fn is_substantial(&self, note: &str) -> bool {
        note.trim().chars().count() >= self.min_note_chars
    }

    /// Add a note and compact if the buffer is full.
    ///
    /// Returns the compaction outcome when one was attempted.
    pub async fn append(&self, entity: &str, note: &str) -> Option<CompactOutcome> {
        let note = note.trim();
        if note.is_empty() {
            return None;
        }
        self.ensure_loaded(entity);

        let len = {
            let mut record = self.records.entry(entity.to_string()).or_default();
            record.recent.push(note.to_string());
            record.recent.len()
        };
        self.persist(entity);
        debug!(entity, recent = len, "Memory note appended");

        if len >= self.max_recent {
            Some(self.compact(entity).await)
        } else {
            None
        }
    }

    /// Fold all but the newest `keep_after_compact` notes into the summary.
    ///
    /// Only the prefix that was handed to the summarizer is removed, so notes
    /// appended while the call is in flight survive.
    pub async fn compact(&self, entity: &str) -> CompactOutcome {
        if !self.compacting.insert(entity.to_string()) {
            debug!(entity, "Compaction already running");
            return CompactOutcome::InProgress;
        }
        let _guard = CompactGuard {
            set: &self.compacting,
            entity: entity.to_string(),
        };

        self.ensure_loaded(entity);
        let Some((summary, older)) = self.records.get(entity).and_then(|record| {
            let split = record.recent.len().checked_sub(self.keep_after_compact)?;
            (split > 0).then(|| (record.summary.clone(), record.recent[..split].to_vec()))
        }) else {
            return CompactOutcome::NotNeeded;
        };

        let new_summary = match self.summarizer.summarize(entity, &summary, &older).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(entity, "Summarizer returned nothing, memory left as is");
                return CompactOutcome::Failed;
            }
            Err(reason) => {
                warn!(entity, reason = %reason, "Memory compaction failed");
                return CompactOutcome::Failed;
            }
        };

        let folded = {
            let Some(mut record) = self.records.get_mut(entity) else {
                return CompactOutcome::Failed;
            };
            let folded = older.len().min(record.recent.len());
            record.summary = new_summary;
            record.recent.drain(..folded);
            folded
        };
        self.persist(entity);
        info!(entity, folded, "Memory compacted");
        CompactOutcome::Compacted { folded }
    }

    /// Rendered memory block for prompts, empty if nothing is known.
    #[must_use]
    pub fn get(&self, entity: &str) -> String {
        self.ensure_loaded(entity);
        self.records
            .get(entity)
            .map(|r| r.render())
            .unwrap_or_default()
    }

    /// Snapshot of the raw record.
    #[must_use]
    pub fn record(&self, entity: &str) -> MemoryRecord {
        self.ensure_loaded(entity);
        self.records
            .get(entity)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Drop the cached copy (roster removal). The persisted record stays.
    pub fn evict(&self, entity: &str) {
        self.records.remove(entity);
    }

    /// Number of cached records.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.records.len()
    }
}
