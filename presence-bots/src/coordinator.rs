//! Conversation coordinator: who answers, when, and how often.
//!
//! For every inbound chat line the coordinator runs the decision protocol
//!
//! 1. direct mention (every mentioned entity),
//! 2. continuity (the entity that last answered this sender, while the link
//!    is live),
//! 3. orchestrator (a completion call picks at most one entity),
//!
//! and then dispatches each chosen entity independently. A dispatch waits a
//! human-looking read delay, asks the completion service for text, cleans it
//! up, checks it, waits a typing delay and sends it. State is re-checked
//! after every suspension point; an entity that went offline or a rate
//! window that filled up in the meantime turns the result into a no-op.
//!
//! The same machinery drives unprompted chatter and the fixed condolence
//! lines sent when a real participant dies.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashSet;
use parking_lot::Mutex;
use presence_core::config::PresenceConfig;
use presence_core::history::ChatHistory;
use presence_core::memory::MemoryStore;
use presence_core::mention::MentionResolver;
use presence_core::rate::{Cooldowns, RateWindow};
use presence_core::roster::RosterDiff;
use presence_core::safety::{BlocklistFilter, ContentCheck, SafetyVerdict, SensitiveTopicFilter};
use presence_core::types::{ChatEvent, Persona};
use presence_llm::parse::parse_orchestrator_pick;
use presence_llm::prompt::{PromptEngine, PromptId};
use presence_llm::{Completion, CompletionRequest, LlmError};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::dialogue::{
    Busyness, format_interests, format_roster, history_block, knowledge_block, memory_block,
    postprocess_reply, read_delay, typing_delay,
};
use crate::links::{ChatterRing, ConversationLinks, PairExchanges};
use crate::memory_bridge::{Exchange, remember_exchange};
use crate::population::PopulationController;
use crate::transport::{Transport, send_lines};

/// Chat lines of live history handed to prompts.
const PROMPT_HISTORY_LINES: usize = 12;

// ---------------------------------------------------------------------------
// Plans and outcomes
// ---------------------------------------------------------------------------

/// Which step of the decision protocol chose the targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchReason {
    /// The message named the entity.
    Mention,
    /// The entity answered this sender recently.
    Continuity,
    /// The orchestrator picked the entity.
    Orchestrator,
}

/// Decision for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchPlan {
    /// Who said it.
    pub sender: String,
    /// What they said.
    pub message: String,
    /// Entities to dispatch, each independently.
    pub targets: Vec<String>,
    /// Protocol step that produced the targets.
    pub reason: DispatchReason,
    /// The message asks about the server itself.
    pub world_question: bool,
}

/// How one dispatch or chatter attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A message went out.
    Sent {
        /// Text as sent.
        text: String,
    },
    /// The entity is not connected (or parked, or unknown).
    Offline,
    /// The entity is muted.
    Muted,
    /// The global rate window is full.
    RateLimited,
    /// The entity is already composing; this attempt was dropped.
    Busy,
    /// The entity spoke too recently to start an unprompted remark.
    CoolingDown,
    /// The completion service failed or produced nothing usable.
    NoReply,
    /// The generated chatter repeated a recent topic.
    Repetitive,
    /// The content check refused the text.
    Rejected {
        /// Why.
        reason: String,
    },
    /// The transport refused the message.
    SendFailed,
}

impl DispatchOutcome {
    /// Whether a message went out.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Clears the busy flag however a dispatch exits.
struct BusyGuard<'a> {
    set: &'a DashSet<String>,
    entity: String,
}

impl<'a> BusyGuard<'a> {
    fn acquire(set: &'a DashSet<String>, entity: &str) -> Option<Self> {
        set.insert(entity.to_string()).then(|| Self {
            set,
            entity: entity.to_string(),
        })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.entity);
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct DialogueState {
    history: ChatHistory,
    rate: RateWindow,
    cooldowns: Cooldowns,
    links: ConversationLinks,
    pairs: PairExchanges,
    ring: ChatterRing,
    resolver: MentionResolver,
}

/// Owns the shared conversation state and runs every dispatch path.
pub struct ConversationCoordinator {
    config: PresenceConfig,
    population: Arc<PopulationController>,
    transport: Arc<dyn Transport>,
    completion: Arc<dyn Completion>,
    memory: Arc<MemoryStore>,
    prompts: Arc<PromptEngine>,
    content: Box<dyn ContentCheck>,
    sensitive: SensitiveTopicFilter,
    state: Mutex<DialogueState>,
    busy: DashSet<String>,
    rng: Mutex<StdRng>,
    me: Weak<Self>,
}

impl std::fmt::Debug for ConversationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConversationCoordinator")
            .field("history", &state.history.len())
            .field("links", &state.links.len())
            .field("busy", &self.busy.len())
            .finish_non_exhaustive()
    }
}

impl ConversationCoordinator {
    /// Build a coordinator over its collaborators.
    #[must_use]
    pub fn new(
        config: &PresenceConfig,
        population: Arc<PopulationController>,
        transport: Arc<dyn Transport>,
        completion: Arc<dyn Completion>,
        memory: Arc<MemoryStore>,
        prompts: Arc<PromptEngine>,
    ) -> Arc<Self> {
        let roster = population.roster();
        let state = DialogueState {
            history: ChatHistory::new(&config.history),
            rate: RateWindow::new(&config.rate_limit),
            cooldowns: Cooldowns::new(Duration::from_secs(config.dialogue.cooldown_secs)),
            links: ConversationLinks::new(Duration::from_secs(config.dialogue.link_ttl_secs)),
            pairs: PairExchanges::new(
                Duration::from_secs(config.chatter.pair_window_secs),
                config.chatter.pair_max_exchanges,
            ),
            ring: ChatterRing::new(config.chatter.recent_topics),
            resolver: MentionResolver::from_personas(&roster),
        };
        Arc::new_cyclic(|me| Self {
            config: config.clone(),
            population,
            transport,
            completion,
            memory,
            prompts,
            content: Box::new(BlocklistFilter::from_config(&config.safety)),
            sensitive: SensitiveTopicFilter::from_config(&config.safety),
            state: Mutex::new(state),
            busy: DashSet::new(),
            rng: Mutex::new(StdRng::from_entropy()),
            me: me.clone(),
        })
    }

    /// Make every random choice deterministic from here on.
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    // -- inbound ------------------------------------------------------------

    /// Fold a line into history. Lines from simulated entities were already
    /// recorded when they were sent and are skipped.
    pub fn record_incoming(&self, sender: &str, text: &str) -> bool {
        if self.population.is_simulated(sender) {
            return false;
        }
        self.state.lock().history.push(ChatEvent::now(sender, text));
        true
    }

    /// Record the line, decide and spawn the dispatches. The returned handles
    /// resolve once each dispatch has finished.
    pub async fn handle_chat(&self, sender: &str, text: &str) -> Vec<JoinHandle<DispatchOutcome>> {
        self.record_incoming(sender, text);
        self.respond(sender, text).await
    }

    /// Decide and spawn dispatches for an already recorded line.
    ///
    /// Lines from simulated entities only go through the mention step,
    /// limited by the per-pair exchange cap.
    pub async fn respond(&self, sender: &str, text: &str) -> Vec<JoinHandle<DispatchOutcome>> {
        let plan = if self.population.is_simulated(sender) {
            self.decide_between_entities(sender, text)
        } else {
            self.decide(sender, text).await
        };
        match plan {
            Some(plan) => self.spawn_dispatches(plan),
            None => Vec::new(),
        }
    }

    fn spawn_dispatches(&self, plan: DispatchPlan) -> Vec<JoinHandle<DispatchOutcome>> {
        let Some(me) = self.me.upgrade() else {
            return Vec::new();
        };
        let plan = Arc::new(plan);
        plan.targets
            .iter()
            .map(|target| {
                let me = me.clone();
                let plan = plan.clone();
                let target = target.clone();
                tokio::spawn(async move { me.dispatch(&target, &plan).await })
            })
            .collect()
    }

    // -- decision -----------------------------------------------------------

    /// Run the decision protocol for a line from a real participant.
    pub async fn decide(&self, sender: &str, text: &str) -> Option<DispatchPlan> {
        let now = now();
        let (mentioned, linked) = {
            let state = self.state.lock();
            let mentioned: Vec<String> = state
                .resolver
                .resolve(text)
                .into_iter()
                .map(str::to_string)
                .collect();
            (mentioned, state.links.get(sender, now).map(str::to_string))
        };

        let plan = |targets: Vec<String>, reason: DispatchReason, world_question: bool| DispatchPlan {
            sender: sender.to_string(),
            message: text.to_string(),
            targets,
            reason,
            world_question,
        };

        if !mentioned.is_empty() {
            debug!(sender, targets = ?mentioned, "Direct mention");
            return Some(plan(mentioned, DispatchReason::Mention, false));
        }
        if let Some(entity) = linked {
            debug!(sender, entity = %entity, "Continuing conversation");
            return Some(plan(vec![entity], DispatchReason::Continuity, false));
        }
        if self.sensitive.is_sensitive(text) {
            debug!(sender, "Sensitive topic, no orchestrator dispatch");
            return None;
        }
        if self.is_limited() {
            debug!(sender, "Rate limited, orchestrator skipped");
            return None;
        }

        let (entity, world_question) = self.orchestrate(sender, text).await?;
        Some(plan(vec![entity], DispatchReason::Orchestrator, world_question))
    }

    fn decide_between_entities(&self, sender: &str, text: &str) -> Option<DispatchPlan> {
        let now = now();
        let state = self.state.lock();
        let targets: Vec<String> = state
            .resolver
            .resolve(text)
            .into_iter()
            .filter(|target| !target.eq_ignore_ascii_case(sender))
            .filter(|target| {
                let allowed = state.pairs.allows(sender, target, now);
                if !allowed {
                    debug!(sender, target = *target, "Pair exchange cap reached");
                }
                allowed
            })
            .map(str::to_string)
            .collect();
        (!targets.is_empty()).then(|| DispatchPlan {
            sender: sender.to_string(),
            message: text.to_string(),
            targets,
            reason: DispatchReason::Mention,
            world_question: false,
        })
    }

    async fn orchestrate(&self, sender: &str, text: &str) -> Option<(String, bool)> {
        let candidates: Vec<Persona> = self
            .population
            .online()
            .into_iter()
            .filter(|p| !p.muted)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let busyness = self.busyness().to_string();
        let history = self.history_text();
        let roster = format_roster(&candidates);
        let request = match self.prompts.request(
            PromptId::Orchestrator,
            &[
                ("roster", &roster),
                ("busyness", &busyness),
                ("history", &history),
                ("sender", sender),
                ("message", text),
            ],
        ) {
            Ok(request) => request.with_timeout(self.config.llm.request_timeout_ms),
            Err(e) => {
                warn!(error = %e, "Orchestrator prompt unavailable");
                return None;
            }
        };

        let response = match self.completion.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(sender, error = %e, "Orchestrator call failed, nobody answers");
                return None;
            }
        };
        let pick = parse_orchestrator_pick(&response.text);
        let name = pick.pick?;
        let Some(chosen) = candidates
            .iter()
            .find(|p| p.username.eq_ignore_ascii_case(&name))
        else {
            debug!(sender, pick = %name, "Orchestrator picked someone outside the roster, declined");
            return None;
        };
        info!(sender, entity = %chosen.username, world_question = pick.world_question, "Orchestrator pick");
        Some((chosen.username.clone(), pick.world_question))
    }

    /// How lively the channel is right now.
    #[must_use]
    pub fn busyness(&self) -> Busyness {
        let window = chrono::Duration::from_std(Duration::from_secs(self.config.dialogue.busy_window_secs))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let recent = self.state.lock().history.count_since(Utc::now() - window);
        Busyness::assess(self.population.real_count(), recent, &self.config.population)
    }

    // -- dispatch -----------------------------------------------------------

    /// Have `entity` answer `plan`.
    ///
    /// No-op when the entity is offline, muted, already busy or the rate
    /// window is full. The busy flag is cleared on every exit path.
    pub async fn dispatch(&self, entity: &str, plan: &DispatchPlan) -> DispatchOutcome {
        let Some(persona) = self.population.persona(entity) else {
            return DispatchOutcome::Offline;
        };
        if persona.muted {
            return DispatchOutcome::Muted;
        }
        if !self.population.is_online(&persona.username) {
            debug!(entity, "Entity offline, dispatch skipped");
            return DispatchOutcome::Offline;
        }
        if let Some(wait) = self.retry_after() {
            debug!(entity, retry_after_ms = millis(wait), "Rate limited, dispatch skipped");
            return DispatchOutcome::RateLimited;
        }
        let Some(_busy) = BusyGuard::acquire(&self.busy, &persona.username) else {
            debug!(entity, sender = %plan.sender, "Entity busy, dispatch dropped");
            return DispatchOutcome::Busy;
        };

        let span = info_span!("dispatch", entity = %persona.username, id = %Uuid::new_v4());
        self.compose_reply(&persona, plan).instrument(span).await
    }

    async fn compose_reply(&self, persona: &Persona, plan: &DispatchPlan) -> DispatchOutcome {
        let name = persona.username.as_str();
        let wait = self.read_delay() + self.state.lock().cooldowns.remaining(name, now());
        debug!(reason = ?plan.reason, wait_ms = millis(wait), "Reading");
        tokio::time::sleep(wait).await;
        if let Some(blocked) = self.still_blocked(name) {
            return blocked;
        }

        let request = match self.reply_request(persona, plan) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Reply prompt unavailable");
                return DispatchOutcome::NoReply;
            }
        };
        let raw = match self.completion.complete(&request).await {
            Ok(response) => response.text,
            Err(e) => {
                warn!(error = %e, "Completion failed, no reply");
                return DispatchOutcome::NoReply;
            }
        };
        let Some(text) = postprocess_reply(&raw, name, self.config.dialogue.max_reply_chars) else {
            debug!("Nothing left after cleanup");
            return DispatchOutcome::NoReply;
        };
        if let SafetyVerdict::Rejected { reason } = self.content.check(&text) {
            info!(reason = %reason, "Reply dropped by content check");
            return DispatchOutcome::Rejected { reason };
        }

        tokio::time::sleep(typing_delay(&text, &self.config.dialogue)).await;
        if let Err(blocked) = self.reserve_send(name) {
            return blocked;
        }
        if let Err(e) = send_lines(self.transport.as_ref(), name, &text, self.line_delay()).await {
            warn!(error = %e, "Send failed");
            return DispatchOutcome::SendFailed;
        }

        let from_entity = self.population.is_simulated(&plan.sender);
        {
            let now = now();
            let mut state = self.state.lock();
            state.history.push(ChatEvent::now(name, text.as_str()));
            if from_entity {
                state.pairs.record(name, &plan.sender, now);
            } else {
                state.links.prune(now);
                state.links.set(&plan.sender, name, now);
            }
        }
        info!(sender = %plan.sender, chars = text.chars().count(), "Reply sent");

        if !from_entity {
            self.spawn_memory_evaluation(name, plan, &text);
        }
        DispatchOutcome::Sent { text }
    }

    fn reply_request(&self, persona: &Persona, plan: &DispatchPlan) -> Result<CompletionRequest, LlmError> {
        let memory = memory_block(&self.memory.get(&persona.username));
        let knowledge = knowledge_block(&self.config.general.server_knowledge, plan.world_question);
        let history = self.history_text();
        let max_chars = self.config.dialogue.max_reply_chars.to_string();
        let request = self.prompts.request(
            PromptId::Reply,
            &[
                ("name", &persona.username),
                ("personality", &persona.personality),
                ("max_chars", &max_chars),
                ("knowledge_block", &knowledge),
                ("memory_block", &memory),
                ("history", &history),
                ("sender", &plan.sender),
                ("message", &plan.message),
            ],
        )?;
        Ok(request
            .with_max_tokens(self.config.llm.reply_max_tokens)
            .with_temperature(self.config.llm.reply_temperature)
            .with_timeout(self.config.llm.request_timeout_ms))
    }

    fn spawn_memory_evaluation(&self, entity: &str, plan: &DispatchPlan, reply: &str) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let entity = entity.to_string();
        let sender = plan.sender.clone();
        let message = plan.message.clone();
        let reply = reply.to_string();
        tokio::spawn(async move {
            let exchange = Exchange {
                entity: &entity,
                sender: &sender,
                message: &message,
                reply: &reply,
            };
            remember_exchange(
                &me.memory,
                me.completion.as_ref(),
                &me.prompts,
                exchange,
                me.config.llm.request_timeout_ms,
            )
            .await;
        });
    }

    // -- chatter ------------------------------------------------------------

    /// Let `entity` make an unprompted remark. With a small probability it
    /// addresses one of `others` by name, if their pair cap allows.
    pub async fn chatter(&self, entity: &str, others: &[String]) -> DispatchOutcome {
        let Some(persona) = self.population.persona(entity) else {
            return DispatchOutcome::Offline;
        };
        if persona.muted {
            return DispatchOutcome::Muted;
        }
        if !self.population.is_online(&persona.username) {
            return DispatchOutcome::Offline;
        }
        if self.is_limited() {
            return DispatchOutcome::RateLimited;
        }
        if self.state.lock().cooldowns.is_cooling(&persona.username, now()) {
            return DispatchOutcome::CoolingDown;
        }
        let Some(_busy) = BusyGuard::acquire(&self.busy, &persona.username) else {
            return DispatchOutcome::Busy;
        };

        let span = info_span!("chatter", entity = %persona.username, id = %Uuid::new_v4());
        self.compose_chatter(&persona, others).instrument(span).await
    }

    fn pick_addressee(&self, entity: &str, others: &[String]) -> Option<String> {
        let probability = self.config.chatter.address_probability.clamp(0.0, 1.0);
        if others.is_empty() || !self.rng.lock().gen_bool(probability) {
            return None;
        }
        let now = now();
        let allowed: Vec<&String> = {
            let state = self.state.lock();
            others
                .iter()
                .filter(|o| !o.eq_ignore_ascii_case(entity) && state.pairs.allows(entity, o, now))
                .collect()
        };
        allowed.choose(&mut *self.rng.lock()).map(|o| (*o).clone())
    }

    async fn compose_chatter(&self, persona: &Persona, others: &[String]) -> DispatchOutcome {
        let name = persona.username.as_str();
        let addressee = self.pick_addressee(name, others);
        let hint = addressee
            .as_ref()
            .map(|other| format!("Address {other} by name."))
            .unwrap_or_default();
        let (history, topics) = {
            let state = self.state.lock();
            (history_block(&state.history, PROMPT_HISTORY_LINES), state.ring.topics())
        };
        let interests = format_interests(persona);
        let max_chars = self.config.dialogue.max_reply_chars.to_string();

        let request = match self.prompts.request(
            PromptId::Chatter,
            &[
                ("name", name),
                ("personality", &persona.personality),
                ("interests", &interests),
                ("max_chars", &max_chars),
                ("history", &history),
                ("avoid_topics", &topics),
                ("address_hint", &hint),
            ],
        ) {
            Ok(request) => request.with_timeout(self.config.llm.request_timeout_ms),
            Err(e) => {
                warn!(error = %e, "Chatter prompt unavailable");
                return DispatchOutcome::NoReply;
            }
        };
        let raw = match self.completion.complete(&request).await {
            Ok(response) => response.text,
            Err(e) => {
                debug!(error = %e, "Chatter completion failed");
                return DispatchOutcome::NoReply;
            }
        };
        let Some(text) = postprocess_reply(&raw, name, self.config.dialogue.max_reply_chars) else {
            return DispatchOutcome::NoReply;
        };
        if self.state.lock().ring.is_repeat(&text) {
            debug!("Chatter repeats a recent topic, dropped");
            return DispatchOutcome::Repetitive;
        }
        if let SafetyVerdict::Rejected { reason } = self.content.check(&text) {
            info!(reason = %reason, "Chatter dropped by content check");
            return DispatchOutcome::Rejected { reason };
        }

        tokio::time::sleep(typing_delay(&text, &self.config.dialogue)).await;
        if let Err(blocked) = self.reserve_send(name) {
            return blocked;
        }
        if let Err(e) = send_lines(self.transport.as_ref(), name, &text, self.line_delay()).await {
            warn!(error = %e, "Chatter send failed");
            return DispatchOutcome::SendFailed;
        }

        {
            let now = now();
            let mut state = self.state.lock();
            state.history.push(ChatEvent::now(name, text.as_str()));
            state.ring.push(text.as_str());
            if let Some(other) = &addressee {
                state.pairs.record(name, other, now);
            }
        }
        info!(addressee = ?addressee, "Chatter sent");
        DispatchOutcome::Sent { text }
    }

    /// Pick a speaker weighted by chattiness and let it chatter.
    ///
    /// Returns `None` when chatter is disabled, the window is full or nobody
    /// is free to talk.
    pub async fn chatter_tick(&self) -> Option<(String, DispatchOutcome)> {
        if !self.config.chatter.enabled || self.is_limited() {
            return None;
        }
        let online = self.population.online();
        let now = now();
        let candidates: Vec<&Persona> = {
            let state = self.state.lock();
            online
                .iter()
                .filter(|p| {
                    !p.muted
                        && p.chattiness > 0.0
                        && !self.busy.contains(&p.username)
                        && !state.cooldowns.is_cooling(&p.username, now)
                })
                .collect()
        };
        let weights: Vec<f64> = candidates.iter().map(|p| p.chattiness).collect();
        let index = WeightedIndex::new(&weights)
            .ok()?
            .sample(&mut *self.rng.lock());
        let speaker = candidates[index].username.clone();
        let others: Vec<String> = online
            .iter()
            .filter(|p| p.username != speaker)
            .map(|p| p.username.clone())
            .collect();

        let outcome = self.chatter(&speaker, &others).await;
        Some((speaker, outcome))
    }

    // -- condolences --------------------------------------------------------

    /// Maybe have one free entity send a fixed condolence line for a real
    /// participant's death. No completion call is made. Returns the entity
    /// that spoke.
    pub async fn condole(&self, player: &str) -> Option<String> {
        if self.population.is_simulated(player) {
            return None;
        }
        let safety = &self.config.safety;
        let probability = safety.condolence_probability.clamp(0.0, 1.0);
        if safety.condolence_lines.is_empty() || !self.rng.lock().gen_bool(probability) {
            debug!(player, "No condolence this time");
            return None;
        }
        if self.is_limited() {
            return None;
        }

        let online = self.population.online();
        let now = now();
        let candidates: Vec<String> = {
            let state = self.state.lock();
            online
                .into_iter()
                .filter(|p| {
                    !p.muted
                        && !self.busy.contains(&p.username)
                        && !state.cooldowns.is_cooling(&p.username, now)
                })
                .map(|p| p.username)
                .collect()
        };
        let (entity, line) = {
            let mut rng = self.rng.lock();
            let entity = candidates.choose(&mut *rng)?.clone();
            let line = safety.condolence_lines.choose(&mut *rng)?.clone();
            (entity, line)
        };

        let _busy = BusyGuard::acquire(&self.busy, &entity)?;
        tokio::time::sleep(self.read_delay()).await;
        if self.reserve_send(&entity).is_err() {
            return None;
        }
        if let Err(e) = self.transport.send(&entity, &line) {
            warn!(entity = %entity, error = %e, "Condolence send failed");
            return None;
        }
        self.state.lock().history.push(ChatEvent::now(entity.as_str(), line.as_str()));
        info!(entity = %entity, player, "Condolence sent");
        Some(entity)
    }

    // -- shared helpers -----------------------------------------------------

    /// Whether the global rate window is full.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.state.lock().rate.is_limited(now())
    }

    fn retry_after(&self) -> Option<Duration> {
        self.state.lock().rate.retry_after(now())
    }

    fn still_blocked(&self, name: &str) -> Option<DispatchOutcome> {
        match self.population.persona(name) {
            None => return Some(DispatchOutcome::Offline),
            Some(p) if p.muted => return Some(DispatchOutcome::Muted),
            Some(_) => {}
        }
        if !self.population.is_online(name) {
            debug!(entity = name, "Went offline while composing");
            return Some(DispatchOutcome::Offline);
        }
        self.is_limited().then_some(DispatchOutcome::RateLimited)
    }

    /// Final check before a send: claim a slot in the rate window and start
    /// the entity's cooldown in one step.
    fn reserve_send(&self, name: &str) -> Result<(), DispatchOutcome> {
        if let Some(blocked) = self.still_blocked(name) {
            return Err(blocked);
        }
        let now = now();
        let mut state = self.state.lock();
        if state.rate.is_limited(now) {
            return Err(DispatchOutcome::RateLimited);
        }
        state.rate.record(now);
        state.cooldowns.record(name, now);
        Ok(())
    }

    fn read_delay(&self) -> Duration {
        read_delay(&mut *self.rng.lock(), &self.config.dialogue)
    }

    fn line_delay(&self) -> Duration {
        Duration::from_millis(self.config.transport.line_delay_ms)
    }

    fn history_text(&self) -> String {
        history_block(&self.state.lock().history, PROMPT_HISTORY_LINES)
    }

    // -- roster & inspection -------------------------------------------------

    /// Follow a roster reload: rebuild the mention index and forget removed
    /// entities' pacing, links and cached memory.
    pub fn apply_roster(&self, diff: &RosterDiff) {
        let roster = self.population.roster();
        {
            let mut state = self.state.lock();
            state.resolver = MentionResolver::from_personas(&roster);
            for name in &diff.removed {
                state.cooldowns.forget(name);
                state.links.forget_entity(name);
                state.pairs.forget_entity(name);
            }
        }
        for name in &diff.removed {
            self.memory.evict(name);
        }
    }

    /// Entity currently linked to `player`, if the link is live.
    #[must_use]
    pub fn link_for(&self, player: &str) -> Option<String> {
        self.state.lock().links.get(player, now()).map(str::to_string)
    }

    /// Live history as `sender: text` lines.
    #[must_use]
    pub fn history_lines(&self) -> Vec<String> {
        self.state.lock().history.events().map(ChatEvent::line).collect()
    }

    /// Sends inside the current rate window.
    #[must_use]
    pub fn sends_in_window(&self) -> usize {
        self.state.lock().rate.count(now())
    }

    /// Whether `entity` is composing right now.
    #[must_use]
    pub fn is_busy(&self, entity: &str) -> bool {
        self.busy.contains(entity)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
