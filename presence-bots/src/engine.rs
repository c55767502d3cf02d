//! Engine runtime: wires the population controller and the coordinator to a
//! transport, a completion service and the wall clock.
//!
//! [`PresenceEngine::run`] is the single event loop. Everything it does is
//! short and non-blocking; dispatches, chatter and condolences are spawned
//! as their own tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use presence_core::config::PresenceConfig;
use presence_core::memory::MemoryStore;
use presence_core::persistence::{RecordStore, SqliteRecordStore};
use presence_core::roster::{RosterDiff, load_roster};
use presence_core::types::Persona;
use presence_core::PresenceError;
use presence_llm::prompt::PromptEngine;
use presence_llm::{Completion, LlmClient, LlmProvider};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordinator::ConversationCoordinator;
use crate::error::EngineError;
use crate::events::{ServerEvent, parse_system_message};
use crate::memory_bridge::LlmSummarizer;
use crate::population::PopulationController;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::transport::{EventReceiver, Transport, TransportEvent, TransportEventKind};

/// External services the engine runs against.
pub struct Collaborators {
    /// Chat connections.
    pub transport: Arc<dyn Transport>,
    /// Text generation.
    pub completion: Arc<dyn Completion>,
    /// Memory record storage.
    pub records: Arc<dyn RecordStore>,
    /// Timers for reconnects and parking.
    pub scheduler: Arc<dyn Scheduler>,
    /// Prompt templates.
    pub prompts: Arc<PromptEngine>,
}

/// The assembled presence engine.
pub struct PresenceEngine {
    config: PresenceConfig,
    roster_path: Option<PathBuf>,
    population: Arc<PopulationController>,
    coordinator: Arc<ConversationCoordinator>,
}

impl std::fmt::Debug for PresenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceEngine")
            .field("roster_path", &self.roster_path)
            .field("population", &self.population)
            .finish_non_exhaustive()
    }
}

impl PresenceEngine {
    /// Assemble an engine from a validated config, a roster and its
    /// collaborators. Nothing connects until [`PresenceEngine::start`].
    ///
    /// # Errors
    /// Invalid config or roster.
    pub fn new(
        config: PresenceConfig,
        roster: Vec<Persona>,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let Collaborators {
            transport,
            completion,
            records,
            scheduler,
            prompts,
        } = collaborators;

        let summarizer = Arc::new(LlmSummarizer::new(
            completion.clone(),
            prompts.clone(),
            config.llm.request_timeout_ms,
        ));
        let memory = Arc::new(MemoryStore::new(&config.memory, records, summarizer));
        let population = PopulationController::new(&config, roster, transport.clone(), scheduler)?;
        let coordinator = ConversationCoordinator::new(
            &config,
            population.clone(),
            transport,
            completion,
            memory,
            prompts,
        );

        Ok(Self {
            config,
            roster_path: None,
            population,
            coordinator,
        })
    }

    /// Build the production engine: roster, memory database and completion
    /// client come from `config`; timers run on the current tokio runtime.
    ///
    /// # Errors
    /// Invalid config, unreadable roster or database, unknown completion
    /// provider, or no tokio runtime.
    pub fn from_config(config: PresenceConfig, transport: Arc<dyn Transport>) -> Result<Self, EngineError> {
        config.validate()?;
        let roster_path = PathBuf::from(&config.general.roster_path);
        let roster = load_roster(&roster_path)?;

        let provider = LlmProvider::from_parts(&config.llm.provider, &config.llm.base_url, &config.llm.api_key)?;
        let client = LlmClient::new(provider, config.llm.model.clone());
        info!(provider = client.provider_name(), model = %config.llm.model, "Completion client ready");

        let records = SqliteRecordStore::open(&config.memory.database_path, config.memory.checksum_enabled)?;
        let collaborators = Collaborators {
            transport,
            completion: Arc::new(client),
            records: Arc::new(records),
            scheduler: Arc::new(TokioScheduler::current()?),
            prompts: Arc::new(PromptEngine::builtin()),
        };
        Ok(Self::new(config, roster, collaborators)?.with_roster_path(roster_path))
    }

    /// Watch `path` for roster changes while running.
    #[must_use]
    pub fn with_roster_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.roster_path = Some(path.into());
        self
    }

    /// Connect the population.
    pub fn start(&self) {
        info!(
            entities = self.population.roster().len(),
            primary = ?self.population.primary(),
            "Presence engine starting"
        );
        self.population.start();
    }

    /// Stop all timers and sessions.
    pub fn shutdown(&self) {
        info!("Presence engine shutting down");
        self.population.shutdown();
    }

    /// The population controller.
    #[must_use]
    pub fn population(&self) -> &Arc<PopulationController> {
        &self.population
    }

    /// The conversation coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<ConversationCoordinator> {
        &self.coordinator
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    // -- events -------------------------------------------------------------

    fn is_ingester(&self, entity: &str) -> bool {
        self.population
            .primary()
            .is_some_and(|primary| primary.eq_ignore_ascii_case(entity))
    }

    /// Route one transport event.
    ///
    /// Session events go to the population controller. Chat and world events
    /// count only when seen by the primary entity, so each line is handled
    /// once however many entities are connected. Returns the spawned
    /// follow-up task, if any.
    pub fn handle_event(&self, event: TransportEvent) -> Option<JoinHandle<()>> {
        match event.kind {
            TransportEventKind::Login | TransportEventKind::Kicked { .. } | TransportEventKind::Ended { .. } => {
                self.population.handle_transport(&event);
                None
            }
            _ if !self.is_ingester(&event.entity) => None,
            TransportEventKind::Chat { sender, text } => Some(self.ingest_chat(sender, text)),
            TransportEventKind::PlayerJoined { name } => {
                self.population.player_joined(&name);
                None
            }
            TransportEventKind::PlayerLeft { name } => {
                self.population.player_left(&name);
                None
            }
            TransportEventKind::SystemMessage { text } => self.ingest_system(&text),
        }
    }

    fn ingest_chat(&self, sender: String, text: String) -> JoinHandle<()> {
        self.coordinator.record_incoming(&sender, &text);
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            for handle in coordinator.respond(&sender, &text).await {
                match handle.await {
                    Ok(outcome) => debug!(sender = %sender, ?outcome, "Dispatch finished"),
                    Err(e) => warn!(sender = %sender, error = %e, "Dispatch task failed"),
                }
            }
        })
    }

    fn ingest_system(&self, text: &str) -> Option<JoinHandle<()>> {
        match parse_system_message(text)? {
            ServerEvent::Chat { sender, text } => Some(self.ingest_chat(sender, text)),
            ServerEvent::Joined { name } => {
                self.population.player_joined(&name);
                None
            }
            ServerEvent::Left { name } => {
                self.population.player_left(&name);
                None
            }
            ServerEvent::Death { player, cause } => {
                if self.population.is_simulated(&player) {
                    return None;
                }
                debug!(player = %player, cause = %cause, "Player died");
                let coordinator = self.coordinator.clone();
                Some(tokio::spawn(async move {
                    coordinator.condole(&player).await;
                }))
            }
            ServerEvent::Advancement { player, title } => {
                debug!(player = %player, title = %title, "Advancement");
                None
            }
        }
    }

    // -- roster -------------------------------------------------------------

    /// Swap in a new roster and let the coordinator follow.
    ///
    /// # Errors
    /// Invalid roster, or one that drops the primary entity.
    pub fn apply_roster(&self, roster: Vec<Persona>) -> Result<RosterDiff, EngineError> {
        let diff = self.population.apply_roster(roster)?;
        self.coordinator.apply_roster(&diff);
        if !diff.is_empty() {
            self.population.rebalance();
        }
        Ok(diff)
    }

    /// Re-read the roster file and apply it.
    ///
    /// # Errors
    /// No roster file configured, or the file is unreadable or invalid. The
    /// current roster stays in place.
    pub fn reload_roster(&self) -> Result<RosterDiff, EngineError> {
        let path = self
            .roster_path
            .as_deref()
            .ok_or_else(|| PresenceError::Roster("no roster file configured".into()))?;
        self.apply_roster(load_roster(path)?)
    }

    fn watch_roster(&self, reload: mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
        let path = self.roster_path.clone()?;
        let file_name = path.file_name()?.to_os_string();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let handler = move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()));
            if relevant {
                let _ = reload.send(());
            }
        };
        let mut watcher = match notify::recommended_watcher(handler) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %e, "Roster watcher unavailable, hot reload disabled");
                return None;
            }
        };
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(dir = %dir.display(), error = %e, "Cannot watch roster directory");
            return None;
        }
        debug!(path = %path.display(), "Watching roster file");
        Some(watcher)
    }

    // -- main loop ----------------------------------------------------------

    fn jitter_interval(&self) -> Duration {
        let p = &self.config.population;
        let low = p.jitter_min_secs.min(p.jitter_max_secs);
        Duration::from_secs(rand::thread_rng().gen_range(low..=p.jitter_max_secs.max(low)))
    }

    fn chatter_interval(&self) -> Duration {
        let c = &self.config.chatter;
        let low = c.min_interval_secs.min(c.max_interval_secs);
        Duration::from_secs(rand::thread_rng().gen_range(low..=c.max_interval_secs.max(low)))
    }

    /// Run until the event channel closes or `shutdown` turns true, then
    /// shut the population down.
    pub async fn run(&self, mut events: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.population.tick_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let jitter = tokio::time::sleep(self.jitter_interval());
        tokio::pin!(jitter);
        let chatter = tokio::time::sleep(self.chatter_interval());
        tokio::pin!(chatter);

        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
        let _watcher = self.watch_roster(reload_tx);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        info!("Transport event channel closed");
                        break;
                    }
                },
                _ = tick.tick() => {
                    let report = self.population.rebalance();
                    debug!(target_active = report.target, active = report.active, "Population tick");
                }
                () = &mut jitter => {
                    let refresh = self.population.refresh_jitter();
                    debug!(jitter = refresh.jitter, rotated = ?refresh.rotated, "Jitter refreshed");
                    self.population.rebalance();
                    jitter.as_mut().reset(Instant::now() + self.jitter_interval());
                }
                () = &mut chatter => {
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Some((entity, outcome)) = coordinator.chatter_tick().await {
                            debug!(entity = %entity, ?outcome, "Chatter tick");
                        }
                    });
                    chatter.as_mut().reset(Instant::now() + self.chatter_interval());
                }
                Some(()) = reload_rx.recv() => {
                    if let Err(e) = self.reload_roster() {
                        warn!(error = %e, "Roster reload failed, keeping current roster");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use presence_llm::{CompletionRequest, CompletionResponse, LlmError};

    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::transport::{LoopbackTransport, event_channel};

    struct Echo(&'static str);

    #[async_trait]
    impl Completion for Echo {
        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            if request.system.contains("long-term memory") {
                return Ok(CompletionResponse::text("NO"));
            }
            Ok(CompletionResponse::text(self.0))
        }
    }

    fn engine() -> (PresenceEngine, Arc<LoopbackTransport>, EventReceiver, Arc<ManualScheduler>) {
        let mut config = PresenceConfig::default();
        config.transport.host = "localhost".into();
        config.transport.connect_stagger_secs = 0;
        let (tx, events) = event_channel();
        let transport = Arc::new(LoopbackTransport::new(tx).with_listener("Steve_Builder"));
        let scheduler = Arc::new(ManualScheduler::new());
        let collaborators = Collaborators {
            transport: transport.clone(),
            completion: Arc::new(Echo("hey there")),
            records: Arc::new(SqliteRecordStore::open_in_memory(true).expect("store")),
            scheduler: scheduler.clone(),
            prompts: Arc::new(PromptEngine::builtin()),
        };
        let roster = vec![Persona::new("Steve_Builder"), Persona::new("Luna")];
        let engine = PresenceEngine::new(config, roster, collaborators).expect("engine");
        (engine, transport, events, scheduler)
    }

    fn pump(engine: &PresenceEngine, events: &mut EventReceiver) {
        while let Ok(event) = events.try_recv() {
            engine.handle_event(event);
        }
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let (tx, _events) = event_channel();
        let collaborators = Collaborators {
            transport: Arc::new(LoopbackTransport::new(tx)),
            completion: Arc::new(Echo("x")),
            records: Arc::new(SqliteRecordStore::open_in_memory(true).expect("store")),
            scheduler: Arc::new(ManualScheduler::new()),
            prompts: Arc::new(PromptEngine::builtin()),
        };
        let result = PresenceEngine::new(PresenceConfig::default(), vec![Persona::new("Luna")], collaborators);
        assert!(matches!(result, Err(EngineError::Core(PresenceError::Config(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn only_primary_ingests_chat() {
        let (engine, transport, mut events, scheduler) = engine();
        engine.start();
        scheduler.advance(Duration::ZERO);
        pump(&engine, &mut events);
        assert_eq!(engine.population().online().len(), 2);

        let ignored = engine.handle_event(TransportEvent::new(
            "Luna",
            TransportEventKind::Chat {
                sender: "Alex".into(),
                text: "luna hi".into(),
            },
        ));
        assert!(ignored.is_none());
        assert!(engine.coordinator().history_lines().is_empty());

        let handle = engine
            .handle_event(TransportEvent::new(
                "Steve_Builder",
                TransportEventKind::Chat {
                    sender: "Alex".into(),
                    text: "luna hi".into(),
                },
            ))
            .expect("dispatch task");
        handle.await.expect("join");
        assert_eq!(transport.sent_by("Luna"), vec!["hey there".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn system_messages_track_players() {
        let (engine, _transport, mut events, scheduler) = engine();
        engine.start();
        scheduler.advance(Duration::ZERO);
        pump(&engine, &mut events);

        engine.handle_event(TransportEvent::new(
            "Steve_Builder",
            TransportEventKind::SystemMessage {
                text: "Alex joined the game".into(),
            },
        ));
        assert_eq!(engine.population().real_count(), 1);
        engine.handle_event(TransportEvent::new(
            "Steve_Builder",
            TransportEventKind::SystemMessage {
                text: "Alex left the game".into(),
            },
        ));
        assert_eq!(engine.population().real_count(), 0);
    }

    #[tokio::test]
    async fn reload_without_path_keeps_roster() {
        let (engine, _transport, _events, _scheduler) = engine();
        assert!(engine.reload_roster().is_err());
        assert_eq!(engine.population().roster().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_signal() {
        let (engine, transport, events, _scheduler) = engine();
        let (stop_tx, stop_rx) = watch::channel(false);
        engine.start();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = stop_tx.send(true);
        });
        engine.run(events, stop_rx).await;
        stopper.await.expect("join");
        assert!(!transport.is_connected("Steve_Builder"));
    }
}
