// Live pet sessions: one owner of the in-memory pet state, driven by two
// independently scheduled timers.
//
// The decay task lowers stats every decay interval; the sync task pushes the
// current snapshot to the database every sync interval. Both share the state
// through a mutex. Shutting a session down stops both tasks and attempts one
// final sync.
//
// While a session is live it owns the pet's stats: every stat write goes
// through the session, and REST stat writes are refused by the registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::actions::{apply_action, Action};
use super::decay::{decay, DecayRates};
use super::{sync_stats, Mood, PetError, Stats};
use crate::db::{Database, Pet};
use crate::metrics;

/// Snapshot of a session's pet, as streamed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub pet_id: i64,
    #[serde(flatten)]
    pub stats: Stats,
    pub alive: bool,
    pub mood: Mood,
}

impl SessionState {
    pub fn from_pet(pet: &Pet) -> Self {
        SessionState {
            pet_id: pet.id,
            stats: pet.stats,
            alive: pet.alive,
            mood: pet.mood,
        }
    }

    fn set_stats(&mut self, stats: Stats) {
        self.stats = stats;
        self.alive = self.alive && stats.health > 0;
        self.mood = Mood::from_stats(&self.stats, self.alive);
    }
}

/// Timer configuration for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimers {
    pub decay_interval: Duration,
    pub sync_interval: Duration,
    pub rates: DecayRates,
}

/// Tracks which pets have their stats claimed, by a live session or by a
/// single REST stat write. At most one claim per pet.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashSet<i64>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pet's stats. `None` if they are already claimed.
    pub fn try_acquire(&self, pet_id: i64) -> Option<SessionSlot> {
        let mut active = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(pet_id) {
            return None;
        }
        Some(SessionSlot {
            registry: self.clone(),
            pet_id,
        })
    }
}

/// Releases the pet's session slot when dropped.
#[derive(Debug)]
pub struct SessionSlot {
    registry: SessionRegistry,
    pet_id: i64,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let mut active = self
            .registry
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        active.remove(&self.pet_id);
    }
}

pub struct PetSession {
    pet_id: i64,
    db: Arc<Database>,
    state: Arc<Mutex<SessionState>>,
    updates: broadcast::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    _slot: SessionSlot,
}

impl PetSession {
    /// Start the decay and sync timers for a pet.
    pub fn start(db: Arc<Database>, pet: &Pet, slot: SessionSlot, timers: SessionTimers) -> Self {
        let state = Arc::new(Mutex::new(SessionState::from_pet(pet)));
        let (updates, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);

        let decay_task = tokio::spawn(run_decay(
            state.clone(),
            updates.clone(),
            shutdown.subscribe(),
            timers.decay_interval,
            timers.rates,
        ));
        let sync_task = tokio::spawn(run_sync(
            db.clone(),
            state.clone(),
            shutdown.subscribe(),
            timers.sync_interval,
        ));

        metrics::LIVE_SESSIONS.inc();
        tracing::info!(pet_id = pet.id, "Pet session started");
        PetSession {
            pet_id: pet.id,
            db,
            state,
            updates,
            shutdown,
            tasks: vec![decay_task, sync_task],
            _slot: slot,
        }
    }

    pub fn pet_id(&self) -> i64 {
        self.pet_id
    }

    pub fn snapshot(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Receive a snapshot after every decay tick.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.updates.subscribe()
    }

    /// Apply a care action. The current snapshot is synced first so the
    /// action builds on decayed stats, then the stored result becomes the
    /// session state.
    pub async fn act(&self, action: Action) -> Result<SessionState, PetError> {
        let stats = self.snapshot().stats;
        sync_stats(&self.db, self.pet_id, stats).await?;
        let pet = apply_action(&self.db, self.pet_id, action).await?;
        Ok(self.adopt(&pet))
    }

    /// Hatch the next generation of a dead pet. The snapshot is synced first,
    /// so a pet that died in memory is recorded dead before the restart.
    pub async fn restart(&self) -> Result<SessionState, PetError> {
        let stats = self.snapshot().stats;
        sync_stats(&self.db, self.pet_id, stats).await?;
        let pet = super::restart(&self.db, self.pet_id).await?;
        Ok(self.adopt(&pet))
    }

    /// Replace the in-memory state with a stored pet.
    pub fn adopt(&self, pet: &Pet) -> SessionState {
        let snapshot = {
            let mut state = lock(&self.state);
            *state = SessionState::from_pet(pet);
            *state
        };
        let _ = self.updates.send(snapshot);
        snapshot
    }

    /// Stop both timers and attempt a final sync. Failures are logged only.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(pet_id = self.pet_id, "Session task ended abnormally: {e}");
            }
        }

        let stats = self.snapshot().stats;
        match sync_stats(&self.db, self.pet_id, stats).await {
            Ok(_) => tracing::info!(pet_id = self.pet_id, "Pet session closed"),
            Err(e) => tracing::warn!(pet_id = self.pet_id, "Final session sync failed: {e}"),
        }
    }
}

impl Drop for PetSession {
    fn drop(&mut self) {
        metrics::LIVE_SESSIONS.dec();
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run_decay(
    state: Arc<Mutex<SessionState>>,
    updates: broadcast::Sender<SessionState>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    rates: DecayRates,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = {
                    let mut state = lock(&state);
                    if state.alive {
                        let next = decay(state.stats, &rates);
                        state.set_stats(next);
                    }
                    *state
                };
                // No subscribers is fine
                let _ = updates.send(snapshot);
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_sync(
    db: Arc<Database>,
    state: Arc<Mutex<SessionState>>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = *lock(&state);
                match sync_stats(&db, snapshot.pet_id, snapshot.stats).await {
                    Ok(_) => metrics::SESSION_SYNCS_TOTAL.inc(),
                    Err(e) => tracing::warn!(pet_id = snapshot.pet_id, "Session sync failed: {e}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
