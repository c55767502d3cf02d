//! Glue between entity memory and the completion service.
//!
//! [`LlmSummarizer`] lets the core [`MemoryStore`] compact notes through a
//! model call. [`remember_exchange`] is the fire-and-forget step run after a
//! reply was sent: ask whether the exchange is worth keeping and append the
//! note if so.

use std::sync::Arc;

use async_trait::async_trait;
use presence_core::memory::{MemoryStore, Summarizer};
use presence_llm::parse::parse_memory_verdict;
use presence_llm::prompt::{PromptEngine, PromptId};
use presence_llm::{Completion, MemoryVerdict};
use tracing::{debug, warn};

/// Compacts memory notes with a completion call.
pub struct LlmSummarizer {
    completion: Arc<dyn Completion>,
    prompts: Arc<PromptEngine>,
    timeout_ms: u64,
}

impl std::fmt::Debug for LlmSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSummarizer")
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl LlmSummarizer {
    /// Create a summarizer over the given completion service.
    #[must_use]
    pub fn new(completion: Arc<dyn Completion>, prompts: Arc<PromptEngine>, timeout_ms: u64) -> Self {
        Self {
            completion,
            prompts,
            timeout_ms,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        entity: &str,
        existing_summary: &str,
        entries: &[String],
    ) -> Result<String, String> {
        let summary = if existing_summary.trim().is_empty() {
            "(none yet)"
        } else {
            existing_summary
        };
        let entries = entries
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        let request = self
            .prompts
            .request(
                PromptId::MemoryCompaction,
                &[("name", entity), ("summary", summary), ("entries", &entries)],
            )
            .map_err(|e| e.to_string())?
            .with_timeout(self.timeout_ms);

        let response = self.completion.complete(&request).await.map_err(|e| e.to_string())?;
        Ok(response.text.trim().to_string())
    }
}

/// One sent reply and what prompted it.
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    /// Entity that replied.
    pub entity: &'a str,
    /// Real participant who spoke first.
    pub sender: &'a str,
    /// What they said.
    pub message: &'a str,
    /// What the entity answered.
    pub reply: &'a str,
}

/// Ask the model whether `exchange` is worth remembering.
///
/// Any failure reads as "no".
pub async fn evaluate_exchange(
    completion: &dyn Completion,
    prompts: &PromptEngine,
    exchange: Exchange<'_>,
    timeout_ms: u64,
) -> Option<String> {
    let request = match prompts.request(
        PromptId::MemoryEvaluation,
        &[
            ("name", exchange.entity),
            ("sender", exchange.sender),
            ("message", exchange.message),
            ("reply", exchange.reply),
        ],
    ) {
        Ok(request) => request.with_timeout(timeout_ms),
        Err(e) => {
            warn!(error = %e, "Memory evaluation prompt unavailable");
            return None;
        }
    };

    match completion.complete(&request).await {
        Ok(response) => match parse_memory_verdict(&response.text) {
            MemoryVerdict::Remember(note) => Some(note),
            MemoryVerdict::Forget => None,
        },
        Err(e) => {
            debug!(entity = exchange.entity, error = %e, "Memory evaluation failed");
            None
        }
    }
}

/// Evaluate an exchange and append the resulting note. Returns whether a
/// note was stored.
pub async fn remember_exchange(
    memory: &MemoryStore,
    completion: &dyn Completion,
    prompts: &PromptEngine,
    exchange: Exchange<'_>,
    timeout_ms: u64,
) -> bool {
    let Some(note) = evaluate_exchange(completion, prompts, exchange, timeout_ms).await else {
        return false;
    };
    if !memory.is_substantial(&note) {
        debug!(entity = exchange.entity, note = %note, "Memory note too short, dropped");
        return false;
    }
    memory.append(exchange.entity, &note).await;
    true
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use presence_core::config::MemoryConfig;
    use presence_core::persistence::SqliteRecordStore;
    use presence_llm::{CompletionRequest, CompletionResponse, LlmError};

    use super::*;

    /// Answers every call with a fixed text and keeps the requests.
    struct Fixed {
        answer: Result<String, ()>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl Fixed {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: Err(()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Completion for Fixed {
        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().push(request.clone());
            match &self.answer {
                Ok(text) => Ok(CompletionResponse::text(text.clone())),
                Err(()) => Err(LlmError::Unavailable("scripted".into())),
            }
        }
    }

    fn memory(completion: Arc<dyn Completion>) -> MemoryStore {
        let store = Arc::new(SqliteRecordStore::open_in_memory(true).expect("store"));
        let summarizer = Arc::new(LlmSummarizer::new(completion, Arc::new(PromptEngine::builtin()), 1000));
        MemoryStore::new(&MemoryConfig::default(), store, summarizer)
    }

    const EXCHANGE: Exchange<'static> = Exchange {
        entity: "Steve_Builder",
        sender: "Alex",
        message: "im building a castle at spawn",
        reply: "nice, need help with the walls?",
    };

    #[tokio::test]
    async fn yes_verdict_is_appended() {
        let completion = Fixed::ok("YES: Alex is building a castle at spawn");
        let memory = memory(completion.clone());
        let prompts = PromptEngine::builtin();

        assert!(remember_exchange(&memory, completion.as_ref(), &prompts, EXCHANGE, 1000).await);
        assert_eq!(
            memory.record("Steve_Builder").recent,
            vec!["Alex is building a castle at spawn".to_string()]
        );
        let seen = completion.seen.lock();
        assert!(seen[0].last_user_turn().is_some_and(|u| u.contains("castle at spawn")));
    }

    #[tokio::test]
    async fn no_verdict_and_failures_store_nothing() {
        let prompts = PromptEngine::builtin();

        let no = Fixed::ok("NO");
        let memory_no = memory(no.clone());
        assert!(!remember_exchange(&memory_no, no.as_ref(), &prompts, EXCHANGE, 1000).await);
        assert!(memory_no.record("Steve_Builder").is_empty());

        let broken = Fixed::failing();
        let memory_broken = memory(broken.clone());
        assert!(!remember_exchange(&memory_broken, broken.as_ref(), &prompts, EXCHANGE, 1000).await);
    }

    #[tokio::test]
    async fn short_notes_are_dropped() {
        let completion = Fixed::ok("YES: ok");
        let memory = memory(completion.clone());
        let prompts = PromptEngine::builtin();
        assert!(!remember_exchange(&memory, completion.as_ref(), &prompts, EXCHANGE, 1000).await);
    }

    #[tokio::test]
    async fn summarizer_sends_bulleted_entries() {
        let completion = Fixed::ok("  Alex builds castles.  ");
        let summarizer = LlmSummarizer::new(completion.clone(), Arc::new(PromptEngine::builtin()), 1000);
        let summary = summarizer
            .summarize("Luna", "", &["Alex likes cats".into(), "Alex lives near spawn".into()])
            .await
            .expect("summary");
        assert_eq!(summary, "Alex builds castles.");

        let seen = completion.seen.lock();
        let user = seen[0].last_user_turn().expect("user turn");
        assert!(user.contains("- Alex likes cats\n- Alex lives near spawn"));
        assert!(user.contains("(none yet)"));
        assert_eq!(seen[0].timeout_ms, 1000);
    }
}
