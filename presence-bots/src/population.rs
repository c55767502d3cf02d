//! Population controller: who is online, and how many should be.
//!
//! Every entity runs the connection state machine
//!
//! ```text
//! Disconnected → Connecting → Connected → (Kicked | Ended) → Disconnected
//!                                      └── too many kicks ──→ Halted
//! ```
//!
//! with an orthogonal `parked` flag. Reconnects, parks and settle delays are
//! timers on a [`Scheduler`], each individually cancellable. The primary
//! entity (roster index 0) owns the global listeners and is never parked.
//!
//! Transport calls are collected while the state lock is held and issued
//! after it is released. Timer callbacks take the state lock themselves, so
//! the lock order is always controller state first, scheduler queue second.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use presence_core::config::{PopulationConfig, PresenceConfig, ReconnectConfig};
use presence_core::error::{PresenceError, Result};
use presence_core::roster::{RosterDiff, diff_roster, validate_roster};
use presence_core::types::Persona;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{Transport, TransportEvent, TransportEventKind};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Connection state of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session and none requested.
    Disconnected,
    /// `connect` was issued, waiting for login.
    Connecting,
    /// Logged in.
    Connected,
    /// Kicked too many times in a row; needs a restart by an operator.
    Halted,
}

/// Point-in-time view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityStatus {
    /// Display name.
    pub username: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Parked by population control.
    pub parked: bool,
    /// A park timer is pending.
    pub park_pending: bool,
    /// Consecutive kicks since the last login.
    pub kicks: u32,
    /// Exempt from automatic parking.
    pub priority: bool,
    /// Connected but silent.
    pub muted: bool,
}

/// What one population tick decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rebalance {
    /// Desired number of active entities.
    pub target: usize,
    /// Active entities before the tick.
    pub active: usize,
    /// Entities scheduled to park.
    pub parking: Vec<String>,
    /// Entities unparked.
    pub unparking: Vec<String>,
}

/// What one jitter refresh decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitterRefresh {
    /// New jitter term.
    pub jitter: i32,
    /// `(parked, unparked)` when a rotation happened.
    pub rotated: Option<(String, String)>,
}

// ---------------------------------------------------------------------------
// Sizing and delays
// ---------------------------------------------------------------------------

/// Desired active count for `real_count` real participants.
///
/// Full roster up to the medium threshold, 75% above it, 50% above the high
/// threshold (rounded up), clamped to `[1, roster_size]`, then shifted by
/// `jitter` and clamped again.
#[must_use]
pub fn target_active(
    real_count: usize,
    roster_size: usize,
    config: &PopulationConfig,
    jitter: i32,
) -> usize {
    if roster_size == 0 {
        return 0;
    }
    let tier = if real_count > config.high_threshold {
        roster_size.div_ceil(2)
    } else if real_count > config.medium_threshold {
        (roster_size * 3).div_ceil(4)
    } else {
        roster_size
    };
    let tier = i64::try_from(tier.clamp(1, roster_size)).unwrap_or(i64::MAX);
    let jittered = tier.saturating_add(i64::from(jitter)).max(1);
    usize::try_from(jittered).map_or(roster_size, |t| t.min(roster_size))
}

/// Delay before retrying after an ordinary disconnect: base plus jitter.
pub fn reconnect_delay<R: Rng + ?Sized>(config: &ReconnectConfig, rng: &mut R) -> Duration {
    Duration::from_secs(config.base_delay_secs + rng.gen_range(0..=config.jitter_secs))
}

/// Backoff after the `kicks`-th consecutive kick:
/// `base · 2^(kicks-1)` plus up to half a base of jitter.
///
/// The jitter is smaller than the gap between two steps, so the delay
/// strictly increases with `kicks`.
pub fn kick_backoff<R: Rng + ?Sized>(config: &ReconnectConfig, kicks: u32, rng: &mut R) -> Duration {
    let base_ms = config.base_delay_secs.max(1) * 1000;
    let exp = kicks.saturating_sub(1).min(20);
    let jitter = rng.gen_range(0..base_ms / 2);
    Duration::from_millis(base_ms.saturating_mul(1 << exp) + jitter)
}

/// Pause between unparking and reconnecting.
pub fn settle_delay<R: Rng + ?Sized>(config: &ReconnectConfig, rng: &mut R) -> Duration {
    let low = config.settle_min_secs.min(config.settle_max_secs);
    Duration::from_secs(rng.gen_range(low..=config.settle_max_secs.max(low)))
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Slot {
    persona: Persona,
    state: ConnectionState,
    parked: bool,
    kicks: u32,
    kicked_pending: bool,
    reconnect: Option<TimerHandle>,
    park: Option<TimerHandle>,
}

impl Slot {
    fn new(persona: Persona) -> Self {
        Self {
            persona,
            state: ConnectionState::Disconnected,
            parked: false,
            kicks: 0,
            kicked_pending: false,
            reconnect: None,
            park: None,
        }
    }

    fn name(&self) -> &str {
        &self.persona.username
    }

    /// Counts toward the active population.
    fn is_active(&self) -> bool {
        !self.parked && self.park.is_none() && self.state != ConnectionState::Halted
    }

    fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting)
    }

    fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.cancel();
        }
    }

    fn cancel_park(&mut self) -> bool {
        match self.park.take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    fn status(&self) -> EntityStatus {
        EntityStatus {
            username: self.persona.username.clone(),
            state: self.state,
            parked: self.parked,
            park_pending: self.park.is_some(),
            kicks: self.kicks,
            priority: self.persona.priority,
            muted: self.persona.muted,
        }
    }
}

enum Action {
    Connect(String),
    Disconnect(String),
}

struct State {
    slots: Vec<Slot>,
    /// Real participants, keyed by lowercased name.
    players: HashMap<String, String>,
    jitter: i32,
    stopped: bool,
    rng: StdRng,
}

impl State {
    fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name() == name)
    }

    fn find(&self, name: &str) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// PopulationController
// ---------------------------------------------------------------------------

/// Owns the roster and every entity's connection lifecycle.
pub struct PopulationController {
    population: PopulationConfig,
    reconnect: ReconnectConfig,
    connect_stagger: Duration,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<State>,
    me: Weak<Self>,
}

impl std::fmt::Debug for PopulationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PopulationController")
            .field("entities", &state.slots.len())
            .field("players", &state.players.len())
            .field("jitter", &state.jitter)
            .finish_non_exhaustive()
    }
}

impl PopulationController {
    /// Create a controller for `roster`. Index 0 is the primary entity.
    ///
    /// # Errors
    /// [`PresenceError::Roster`] if the roster is invalid.
    pub fn new(
        config: &PresenceConfig,
        roster: Vec<Persona>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>> {
        Self::with_rng(config, roster, transport, scheduler, StdRng::from_entropy())
    }

    /// Like [`PopulationController::new`] with a deterministic random source.
    ///
    /// # Errors
    /// [`PresenceError::Roster`] if the roster is invalid.
    pub fn with_seed(
        config: &PresenceConfig,
        roster: Vec<Persona>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        seed: u64,
    ) -> Result<Arc<Self>> {
        Self::with_rng(config, roster, transport, scheduler, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: &PresenceConfig,
        roster: Vec<Persona>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        rng: StdRng,
    ) -> Result<Arc<Self>> {
        validate_roster(&roster)?;
        Ok(Arc::new_cyclic(|me| Self {
            population: config.population.clone(),
            reconnect: config.reconnect.clone(),
            connect_stagger: Duration::from_secs(config.transport.connect_stagger_secs),
            transport,
            scheduler,
            state: Mutex::new(State {
                slots: roster.into_iter().map(Slot::new).collect(),
                players: HashMap::new(),
                jitter: 0,
                stopped: false,
                rng,
            }),
            me: me.clone(),
        }))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Connect the primary now and every other entity staggered behind it.
    pub fn start(&self) {
        let names: Vec<String> = self.state.lock().slots.iter().map(|s| s.name().to_string()).collect();
        info!(entities = names.len(), "Starting population");
        for (name, i) in names.iter().zip(0u32..) {
            if i == 0 {
                self.connect_now(name);
            } else {
                let mut guard = self.state.lock();
                if let Some(index) = guard.index_of(name) {
                    self.schedule_connect(&mut guard.slots[index], self.connect_stagger * i);
                }
            }
        }
    }

    /// Cancel every timer and end every session. Nothing reconnects after.
    pub fn shutdown(&self) {
        let actions: Vec<Action> = {
            let mut state = self.state.lock();
            state.stopped = true;
            state
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.cancel_reconnect();
                    slot.cancel_park();
                    slot.is_live().then(|| Action::Disconnect(slot.name().to_string()))
                })
                .collect()
        };
        self.execute(actions);
        info!("Population stopped");
    }

    fn schedule_connect(&self, slot: &mut Slot, delay: Duration) {
        slot.cancel_reconnect();
        let me = self.me.clone();
        let name = slot.name().to_string();
        slot.reconnect = Some(self.scheduler.after(
            delay,
            Box::new(move || {
                if let Some(controller) = me.upgrade() {
                    controller.connect_now(&name);
                }
            }),
        ));
    }

    fn connect_now(&self, name: &str) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            let Some(index) = state.index_of(name) else {
                return;
            };
            let slot = &mut state.slots[index];
            slot.reconnect = None;
            if slot.parked || slot.state != ConnectionState::Disconnected {
                debug!(entity = name, state = ?slot.state, parked = slot.parked, "Connect skipped");
                return;
            }
            slot.state = ConnectionState::Connecting;
        }
        self.execute(vec![Action::Connect(name.to_string())]);
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect(name) => {
                    info!(entity = %name, "Connecting");
                    if let Err(e) = self.transport.connect(&name) {
                        warn!(entity = %name, error = %e, "Connect failed");
                        self.connect_failed(&name);
                    }
                }
                Action::Disconnect(name) => {
                    if let Err(e) = self.transport.disconnect(&name) {
                        debug!(entity = %name, error = %e, "Disconnect ignored");
                    }
                }
            }
        }
    }

    fn connect_failed(&self, name: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(index) = state.index_of(name) else {
            return;
        };
        state.slots[index].state = ConnectionState::Disconnected;
        if state.stopped || state.slots[index].parked {
            return;
        }
        let delay = reconnect_delay(&self.reconnect, &mut state.rng);
        self.schedule_connect(&mut state.slots[index], delay);
    }

    // -- transport events ---------------------------------------------------

    /// Feed a lifecycle event from the transport. Chat and presence events
    /// are ignored here.
    pub fn handle_transport(&self, event: &TransportEvent) {
        match &event.kind {
            TransportEventKind::Login => self.on_login(&event.entity),
            TransportEventKind::Kicked { reason } => self.on_kicked(&event.entity, reason),
            TransportEventKind::Ended { reason } => self.on_ended(&event.entity, reason),
            _ => {}
        }
    }

    fn on_login(&self, name: &str) {
        let disconnect = {
            let mut state = self.state.lock();
            let stopped = state.stopped;
            let Some(index) = state.index_of(name) else {
                return;
            };
            let slot = &mut state.slots[index];
            slot.state = ConnectionState::Connected;
            slot.kicks = 0;
            slot.kicked_pending = false;
            slot.cancel_reconnect();
            info!(entity = name, parked = slot.parked, "Logged in");
            slot.parked || stopped
        };
        if disconnect {
            self.execute(vec![Action::Disconnect(name.to_string())]);
        }
    }

    fn on_kicked(&self, name: &str, reason: &str) {
        let mut state = self.state.lock();
        let Some(index) = state.index_of(name) else {
            return;
        };
        let slot = &mut state.slots[index];
        slot.kicks += 1;
        slot.kicked_pending = true;
        if slot.kicks >= self.reconnect.max_kicks {
            slot.state = ConnectionState::Halted;
            slot.cancel_reconnect();
            slot.cancel_park();
            error!(entity = name, kicks = slot.kicks, reason, "Kicked too often, entity halted until restarted");
        } else {
            warn!(entity = name, kicks = slot.kicks, reason, "Kicked");
        }
    }

    fn on_ended(&self, name: &str, reason: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(index) = state.index_of(name) else {
            return;
        };
        let slot = &mut state.slots[index];
        if slot.state == ConnectionState::Halted {
            info!(entity = name, reason, "Session ended, entity stays halted");
            return;
        }
        slot.state = ConnectionState::Disconnected;
        let kicked = std::mem::take(&mut slot.kicked_pending);
        let kicks = slot.kicks;
        if state.stopped || slot.parked {
            debug!(entity = name, reason, "Session ended, no reconnect");
            return;
        }

        let delay = if kicked {
            kick_backoff(&self.reconnect, kicks, &mut state.rng)
        } else {
            reconnect_delay(&self.reconnect, &mut state.rng)
        };
        info!(
            entity = name,
            reason,
            kicked,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Session ended, reconnect scheduled"
        );
        self.schedule_connect(&mut state.slots[index], delay);
    }

    // -- parking ------------------------------------------------------------

    /// Park `name` once `delay` has passed. Returns `false` for the primary,
    /// unknown, halted or already parked entities.
    pub fn park(&self, name: &str, delay: Duration) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.index_of(name) else {
            return false;
        };
        if index == 0 {
            warn!(entity = name, "Primary entity is never parked");
            return false;
        }
        let slot = &mut state.slots[index];
        if slot.parked || slot.state == ConnectionState::Halted {
            return false;
        }
        slot.cancel_park();
        let me = self.me.clone();
        let owned = name.to_string();
        slot.park = Some(self.scheduler.after(
            delay,
            Box::new(move || {
                if let Some(controller) = me.upgrade() {
                    controller.park_now(&owned);
                }
            }),
        ));
        debug!(entity = name, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Park scheduled");
        true
    }

    fn park_now(&self, name: &str) {
        let disconnect = {
            let mut state = self.state.lock();
            let Some(index) = state.index_of(name) else {
                return;
            };
            let slot = &mut state.slots[index];
            slot.park = None;
            slot.parked = true;
            slot.cancel_reconnect();
            info!(entity = name, "Parked");
            slot.state == ConnectionState::Connected
        };
        if disconnect {
            self.execute(vec![Action::Disconnect(name.to_string())]);
        }
    }

    /// Clear the parked flag and cancel a pending park. A disconnected
    /// entity reconnects after a settle delay. Returns whether anything
    /// changed.
    pub fn unpark(&self, name: &str) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(index) = state.index_of(name) else {
            return false;
        };
        let slot = &mut state.slots[index];
        let cancelled = slot.cancel_park();
        if !slot.parked {
            if cancelled {
                debug!(entity = name, "Pending park cancelled");
            }
            return cancelled;
        }
        slot.parked = false;
        let reconnect = slot.state == ConnectionState::Disconnected && !state.stopped;
        info!(entity = name, reconnect, "Unparked");
        if reconnect {
            let delay = settle_delay(&self.reconnect, &mut state.rng);
            self.schedule_connect(&mut state.slots[index], delay);
        }
        true
    }

    // -- sizing -------------------------------------------------------------

    /// Park or unpark entities so the active count meets the current target.
    pub fn rebalance(&self) -> Rebalance {
        let (target, active, parking, unparking) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopped {
                return Rebalance::default();
            }
            let target = target_active(state.players.len(), state.slots.len(), &self.population, state.jitter);
            let active = state.slots.iter().filter(|s| s.is_active()).count();

            let mut parking = Vec::new();
            let mut unparking = Vec::new();
            if active > target {
                parking = state
                    .slots
                    .iter()
                    .skip(1)
                    .filter(|s| s.is_active() && !s.persona.priority)
                    .map(|s| s.name().to_string())
                    .collect();
                parking.shuffle(&mut state.rng);
                parking.truncate(active - target);
            } else if active < target {
                unparking = state
                    .slots
                    .iter()
                    .filter(|s| (s.parked || s.park.is_some()) && s.state != ConnectionState::Halted)
                    .map(|s| s.name().to_string())
                    .collect();
                unparking.shuffle(&mut state.rng);
                unparking.truncate(target - active);
            }
            (target, active, parking, unparking)
        };

        let stagger_ms = self.population.park_stagger_secs * 1000;
        for (name, i) in parking.iter().zip(0u64..) {
            let offset = if stagger_ms > 0 {
                self.state.lock().rng.gen_range(0..stagger_ms)
            } else {
                0
            };
            self.park(name, Duration::from_millis(stagger_ms * i + offset));
        }
        for name in &unparking {
            self.unpark(name);
        }

        if parking.is_empty() && unparking.is_empty() {
            debug!(target, active, "Population on target");
        } else {
            info!(target, active, parking = parking.len(), unparking = unparking.len(), "Population rebalanced");
        }
        Rebalance {
            target,
            active,
            parking,
            unparking,
        }
    }

    /// Draw a new jitter term and maybe rotate one active entity out and one
    /// parked entity in.
    pub fn refresh_jitter(&self) -> JitterRefresh {
        let (jitter, rotated, offset) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.jitter = state.rng.gen_range(-1..=1);
            let rotate = state
                .rng
                .gen_bool(self.population.rotation_probability.clamp(0.0, 1.0));
            let rotated = if rotate {
                let active: Vec<String> = state
                    .slots
                    .iter()
                    .skip(1)
                    .filter(|s| s.is_active() && !s.persona.priority)
                    .map(|s| s.name().to_string())
                    .collect();
                let parked: Vec<String> = state
                    .slots
                    .iter()
                    .filter(|s| s.parked && s.park.is_none() && s.state != ConnectionState::Halted)
                    .map(|s| s.name().to_string())
                    .collect();
                match (active.choose(&mut state.rng), parked.choose(&mut state.rng)) {
                    (Some(out), Some(back)) => Some((out.clone(), back.clone())),
                    _ => None,
                }
            } else {
                None
            };
            let stagger_ms = self.population.park_stagger_secs * 1000;
            let offset = if stagger_ms > 0 { state.rng.gen_range(0..stagger_ms) } else { 0 };
            (state.jitter, rotated, offset)
        };

        if let Some((out, back)) = &rotated {
            info!(out = %out, back = %back, "Rotating entities");
            self.park(out, Duration::from_millis(offset));
            self.unpark(back);
        }
        debug!(jitter, "Population jitter refreshed");
        JitterRefresh { jitter, rotated }
    }

    // -- real participants --------------------------------------------------

    /// Note a real participant joining. Simulated names are ignored.
    /// Returns whether the set changed.
    pub fn player_joined(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        if state.find(name).is_some() {
            return false;
        }
        let added = state
            .players
            .insert(name.to_lowercase(), name.to_string())
            .is_none();
        if added {
            debug!(player = name, players = state.players.len(), "Player joined");
        }
        added
    }

    /// Note a real participant leaving. Returns whether the set changed.
    pub fn player_left(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.players.remove(&name.to_lowercase()).is_some();
        if removed {
            debug!(player = name, players = state.players.len(), "Player left");
        }
        removed
    }

    /// Number of real participants present.
    #[must_use]
    pub fn real_count(&self) -> usize {
        self.state.lock().players.len()
    }

    /// Real participants present, sorted.
    #[must_use]
    pub fn players(&self) -> Vec<String> {
        let mut players: Vec<String> = self.state.lock().players.values().cloned().collect();
        players.sort();
        players
    }

    // -- roster -------------------------------------------------------------

    /// Apply a freshly loaded roster: connect additions, disconnect and
    /// forget removals, update changed traits in place.
    ///
    /// # Errors
    /// [`PresenceError::Roster`] if the roster is invalid or drops the
    /// primary entity; nothing is changed in that case.
    pub fn apply_roster(&self, roster: Vec<Persona>) -> Result<RosterDiff> {
        validate_roster(&roster)?;
        let (diff, actions) = {
            let mut state = self.state.lock();
            let current: Vec<Persona> = state.slots.iter().map(|s| s.persona.clone()).collect();
            let diff = diff_roster(&current, &roster);
            if let Some(primary) = current.first() {
                if diff.removed.contains(&primary.username) {
                    warn!(entity = %primary.username, "Roster reload would remove the primary entity, ignored");
                    return Err(PresenceError::Roster(format!(
                        "primary entity {} cannot be removed",
                        primary.username
                    )));
                }
            }

            let mut actions = Vec::new();
            for name in &diff.removed {
                if let Some(index) = state.index_of(name) {
                    let mut slot = state.slots.remove(index);
                    slot.cancel_reconnect();
                    slot.cancel_park();
                    if slot.is_live() {
                        actions.push(Action::Disconnect(name.clone()));
                    }
                }
            }
            for persona in &diff.changed {
                if let Some(index) = state.index_of(&persona.username) {
                    state.slots[index].persona = persona.clone();
                }
            }
            for persona in &diff.added {
                state.players.remove(&persona.username.to_lowercase());
                state.slots.push(Slot::new(persona.clone()));
            }
            (diff, actions)
        };

        self.execute(actions);
        for persona in &diff.added {
            self.connect_now(&persona.username);
        }
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Roster reloaded"
        );
        Ok(diff)
    }

    /// Username of the primary entity.
    #[must_use]
    pub fn primary(&self) -> Option<String> {
        self.state.lock().slots.first().map(|s| s.name().to_string())
    }

    /// Current roster, in order.
    #[must_use]
    pub fn roster(&self) -> Vec<Persona> {
        self.state.lock().slots.iter().map(|s| s.persona.clone()).collect()
    }

    /// Persona by name, compared case-insensitively.
    #[must_use]
    pub fn persona(&self, name: &str) -> Option<Persona> {
        self.state.lock().find(name).map(|s| s.persona.clone())
    }

    /// Whether `name` is one of the simulated entities.
    #[must_use]
    pub fn is_simulated(&self, name: &str) -> bool {
        self.state.lock().find(name).is_some()
    }

    /// Connected and not parked.
    #[must_use]
    pub fn is_online(&self, name: &str) -> bool {
        self.state
            .lock()
            .find(name)
            .is_some_and(|s| s.state == ConnectionState::Connected && !s.parked)
    }

    /// Personas of every online entity, in roster order.
    #[must_use]
    pub fn online(&self) -> Vec<Persona> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.state == ConnectionState::Connected && !s.parked)
            .map(|s| s.persona.clone())
            .collect()
    }

    /// Status of one entity.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<EntityStatus> {
        self.state.lock().find(name).map(Slot::status)
    }

    /// Status of every entity, in roster order.
    #[must_use]
    pub fn statuses(&self) -> Vec<EntityStatus> {
        self.state.lock().slots.iter().map(Slot::status).collect()
    }

    /// Current jitter term.
    #[must_use]
    pub fn jitter(&self) -> i32 {
        self.state.lock().jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::transport::{EventReceiver, LoopbackTransport, event_channel};

    fn config() -> PresenceConfig {
        let mut config = PresenceConfig::default();
        config.transport.host = "localhost".into();
        config
    }

    struct Rig {
        controller: Arc<PopulationController>,
        transport: Arc<LoopbackTransport>,
        scheduler: Arc<ManualScheduler>,
        events: EventReceiver,
    }

    impl Rig {
        fn new(roster: Vec<Persona>, manual_login: bool) -> Self {
            Self::with_config(&config(), roster, manual_login)
        }

        fn with_config(config: &PresenceConfig, roster: Vec<Persona>, manual_login: bool) -> Self {
            let (tx, events) = event_channel();
            let transport = LoopbackTransport::new(tx);
            let transport = Arc::new(if manual_login { transport.manual_login() } else { transport });
            let scheduler = Arc::new(ManualScheduler::new());
            let controller =
                PopulationController::with_seed(config, roster, transport.clone(), scheduler.clone(), 7)
                    .expect("controller");
            Self {
                controller,
                transport,
                scheduler,
                events,
            }
        }

        fn named(names: &[&str], manual_login: bool) -> Self {
            Self::new(names.iter().map(|n| Persona::new(*n)).collect(), manual_login)
        }

        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.controller.handle_transport(&event);
            }
        }

        fn advance(&mut self, by: Duration) {
            self.scheduler.advance(by);
            self.pump();
        }

        fn state_of(&self, name: &str) -> ConnectionState {
            self.controller.status(name).expect("status").state
        }
    }

    #[test]
    fn target_tiers() {
        let config = PopulationConfig::default();
        assert_eq!(target_active(1, 10, &config, 0), 10);
        assert_eq!(target_active(6, 10, &config, 0), 10);
        assert_eq!(target_active(7, 10, &config, 0), 8);
        assert_eq!(target_active(11, 10, &config, 0), 5);
        assert_eq!(target_active(11, 3, &config, 0), 2);
        assert_eq!(target_active(50, 1, &config, 0), 1);
        assert_eq!(target_active(1, 10, &config, -1), 9);
        assert_eq!(target_active(1, 10, &config, 1), 10);
        assert_eq!(target_active(50, 1, &config, -1), 1);
        assert_eq!(target_active(0, 0, &config, 0), 0);
    }

    #[test]
    fn start_connects_primary_then_staggers() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna", "Kai"], false);
        rig.controller.start();
        rig.pump();
        assert_eq!(rig.transport.connect_calls(), vec!["Steve_Builder"]);
        assert_eq!(rig.state_of("Steve_Builder"), ConnectionState::Connected);

        rig.advance(Duration::from_secs(5));
        rig.advance(Duration::from_secs(5));
        assert_eq!(rig.transport.connect_calls(), vec!["Steve_Builder", "Luna", "Kai"]);
        assert_eq!(rig.controller.online().len(), 3);
    }

    #[test]
    fn ordinary_end_reconnects_after_base_plus_jitter() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], false);
        rig.controller.start();
        rig.advance(Duration::from_secs(5));

        rig.transport.drop_session("Luna", "timed out");
        rig.pump();
        assert_eq!(rig.state_of("Luna"), ConnectionState::Disconnected);
        let delays = rig.scheduler.pending_delays();
        assert_eq!(delays.len(), 1);
        assert!(delays[0] >= Duration::from_secs(10) && delays[0] <= Duration::from_secs(40));

        rig.advance(Duration::from_secs(40));
        assert_eq!(rig.state_of("Luna"), ConnectionState::Connected);
    }

    #[test]
    fn kick_backoff_strictly_increases_then_halts() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], true);
        rig.controller.start();
        rig.transport.login("Steve_Builder");
        rig.advance(Duration::from_secs(5));
        assert_eq!(rig.state_of("Luna"), ConnectionState::Connecting);

        let mut previous = Duration::ZERO;
        for kick in 1..=4 {
            rig.transport.kick("Luna", "you are banned");
            rig.pump();
            let delays = rig.scheduler.pending_delays();
            assert_eq!(delays.len(), 1, "kick {kick} schedules one reconnect");
            assert!(delays[0] > previous, "kick {kick}: {:?} <= {previous:?}", delays[0]);
            previous = delays[0];
            rig.advance(delays[0]);
        }

        rig.transport.kick("Luna", "you are banned");
        rig.pump();
        assert_eq!(rig.state_of("Luna"), ConnectionState::Halted);
        assert_eq!(rig.scheduler.pending(), 0);

        let calls_before = rig.transport.connect_calls().len();
        rig.advance(Duration::from_secs(3600));
        assert_eq!(rig.transport.connect_calls().len(), calls_before);
    }

    #[test]
    fn kick_backoff_formula() {
        let config = ReconnectConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let first = kick_backoff(&config, 1, &mut rng);
        let second = kick_backoff(&config, 2, &mut rng);
        assert!(first >= Duration::from_secs(10) && first < Duration::from_secs(15));
        assert!(second >= Duration::from_secs(20) && second < Duration::from_secs(25));
    }

    #[test]
    fn login_resets_kick_counter() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], true);
        rig.controller.start();
        rig.advance(Duration::from_secs(5));
        rig.transport.kick("Luna", "spam");
        rig.pump();
        assert_eq!(rig.controller.status("Luna").expect("status").kicks, 1);

        let delay = rig.scheduler.pending_delays()[0];
        rig.advance(delay);
        rig.transport.login("Luna");
        rig.pump();
        let status = rig.controller.status("Luna").expect("status");
        assert_eq!(status.kicks, 0);
        assert_eq!(status.state, ConnectionState::Connected);
    }

    #[test]
    fn unpark_cancels_pending_park() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], false);
        rig.controller.start();
        rig.advance(Duration::from_secs(5));

        assert!(rig.controller.park("Luna", Duration::from_secs(20)));
        assert!(rig.controller.status("Luna").expect("status").park_pending);
        rig.advance(Duration::from_secs(10));
        assert!(rig.controller.unpark("Luna"));
        rig.advance(Duration::from_secs(30));

        let status = rig.controller.status("Luna").expect("status");
        assert!(!status.parked);
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(rig.transport.is_connected("Luna"));
    }

    #[test]
    fn park_disconnects_and_unpark_settles_back() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], false);
        rig.controller.start();
        rig.advance(Duration::from_secs(5));

        assert!(rig.controller.park("Luna", Duration::from_secs(20)));
        rig.advance(Duration::from_secs(20));
        assert!(!rig.transport.is_connected("Luna"));
        assert!(rig.controller.status("Luna").expect("status").parked);
        assert_eq!(rig.scheduler.pending(), 0, "parked entities do not reconnect");

        assert!(rig.controller.unpark("Luna"));
        let delays = rig.scheduler.pending_delays();
        assert_eq!(delays.len(), 1);
        assert!(delays[0] >= Duration::from_secs(10) && delays[0] <= Duration::from_secs(20));
        rig.advance(Duration::from_secs(20));
        assert!(rig.controller.is_online("Luna"));
    }

    #[test]
    fn primary_is_never_parked() {
        let rig = Rig::named(&["Steve_Builder", "Luna"], false);
        assert!(!rig.controller.park("Steve_Builder", Duration::ZERO));
    }

    #[test]
    fn rebalance_parks_and_unparks_around_the_target() {
        let mut roster: Vec<Persona> = ["Steve_Builder", "Luna", "Kai", "Mira", "Oak", "Pip", "Rex", "Sol", "Tam", "Vex"]
            .iter()
            .map(|n| Persona::new(*n))
            .collect();
        roster[1].priority = true;
        let mut rig = Rig::new(roster, false);
        rig.controller.start();
        rig.advance(Duration::from_secs(60));
        assert_eq!(rig.controller.online().len(), 10);

        for i in 0..11 {
            rig.controller.player_joined(&format!("player{i}"));
        }
        let tick = rig.controller.rebalance();
        assert_eq!(tick.target, 5);
        assert_eq!(tick.active, 10);
        assert_eq!(tick.parking.len(), 5);
        assert!(!tick.parking.iter().any(|n| n == "Steve_Builder" || n == "Luna"));

        rig.advance(Duration::from_secs(200));
        assert_eq!(rig.controller.online().len(), 5);
        assert!(rig.controller.is_online("Steve_Builder"));
        assert!(rig.controller.is_online("Luna"));

        for i in 0..11 {
            rig.controller.player_left(&format!("player{i}"));
        }
        let tick = rig.controller.rebalance();
        assert_eq!(tick.target, 10);
        assert_eq!(tick.unparking.len(), 5);
        rig.advance(Duration::from_secs(20));
        assert_eq!(rig.controller.online().len(), 10);
    }

    #[test]
    fn jitter_stays_in_range() {
        let rig = Rig::named(&["Steve_Builder", "Luna", "Kai"], false);
        for _ in 0..50 {
            let refresh = rig.controller.refresh_jitter();
            assert!((-1..=1).contains(&refresh.jitter));
            assert!(refresh.rotated.is_none(), "nothing is parked, so nothing rotates");
        }
    }

    #[test]
    fn rotation_swaps_one_active_entity_for_a_parked_one() {
        let mut config = config();
        config.population.rotation_probability = 1.0;
        let mut luna = Persona::new("Luna");
        luna.priority = true;
        let roster = vec![Persona::new("Steve_Builder"), luna, Persona::new("Kai"), Persona::new("Mira")];
        let mut rig = Rig::with_config(&config, roster, false);
        rig.controller.start();
        for _ in 0..3 {
            rig.advance(Duration::from_secs(5));
        }
        assert!(rig.controller.park("Mira", Duration::ZERO));
        rig.advance(Duration::ZERO);
        let online_before = rig.controller.online().len();
        assert_eq!(online_before, 3);

        let refresh = rig.controller.refresh_jitter();
        // Kai is the only active entity that is neither primary nor priority.
        assert_eq!(refresh.rotated, Some(("Kai".to_string(), "Mira".to_string())));
        rig.advance(Duration::from_secs(25));

        let online: Vec<String> = rig.controller.online().into_iter().map(|p| p.username).collect();
        assert_eq!(online, vec!["Steve_Builder", "Luna", "Mira"]);
        assert_eq!(online.len(), online_before);
        assert!(rig.controller.status("Kai").expect("status").parked);
        assert!(!rig.transport.is_connected("Kai"));
    }

    #[test]
    fn simulated_names_are_not_players() {
        let rig = Rig::named(&["Steve_Builder", "Luna"], false);
        assert!(!rig.controller.player_joined("luna"));
        assert!(rig.controller.player_joined("Alex"));
        assert!(!rig.controller.player_joined("alex"));
        assert_eq!(rig.controller.real_count(), 1);
        assert!(rig.controller.player_left("ALEX"));
        assert_eq!(rig.controller.real_count(), 0);
    }

    #[test]
    fn hot_reload_applies_diff_and_protects_primary() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], false);
        rig.controller.start();
        rig.advance(Duration::from_secs(5));

        let without_primary = vec![Persona::new("Luna")];
        assert!(rig.controller.apply_roster(without_primary).is_err());
        assert_eq!(rig.controller.roster().len(), 2);

        let reloaded = vec![
            Persona::new("Steve_Builder").with_personality("now grumpy"),
            Persona::new("Kai"),
        ];
        let diff = rig.controller.apply_roster(reloaded).expect("reload");
        rig.pump();
        assert_eq!(diff.removed, vec!["Luna".to_string()]);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.changed.len(), 1);
        assert!(!rig.transport.is_connected("Luna"));
        assert!(rig.controller.is_online("Kai"));
        assert_eq!(
            rig.controller.persona("Steve_Builder").expect("primary").personality,
            "now grumpy"
        );
        assert_eq!(rig.scheduler.pending(), 0, "removed entities leave no timers");
    }

    #[test]
    fn shutdown_stops_reconnects() {
        let mut rig = Rig::named(&["Steve_Builder", "Luna"], false);
        rig.controller.start();
        rig.advance(Duration::from_secs(5));
        rig.controller.shutdown();
        rig.pump();
        assert!(!rig.transport.is_connected("Steve_Builder"));
        assert!(!rig.transport.is_connected("Luna"));
        assert_eq!(rig.scheduler.pending(), 0);
        assert!(rig.controller.rebalance().parking.is_empty());
    }
}
