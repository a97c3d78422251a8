// Pet domain: bounded stats, mood, memory kinds and the error taxonomy.

pub mod actions;
pub mod decay;
pub mod session;
pub mod world;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{Database, Pet};

pub const STAT_MIN: i64 = 0;
pub const STAT_MAX: i64 = 100;

pub const NAME_MAX_CHARS: usize = 20;
pub const DEFAULT_PET_NAME: &str = "Tama";

/// Clamp a raw stat value into `[STAT_MIN, STAT_MAX]`.
pub fn clamp_stat(value: i64) -> i64 {
    value.clamp(STAT_MIN, STAT_MAX)
}

/// The five bounded pet stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub hunger: i64,
    pub happiness: i64,
    pub energy: i64,
    pub hygiene: i64,
    pub health: i64,
}

impl Stats {
    /// Stats of a newly hatched (or restarted) pet.
    pub const FRESH: Stats = Stats {
        hunger: 80,
        happiness: 80,
        energy: 80,
        hygiene: 80,
        health: 100,
    };

    pub fn clamped(self) -> Stats {
        Stats {
            hunger: clamp_stat(self.hunger),
            happiness: clamp_stat(self.happiness),
            energy: clamp_stat(self.energy),
            hygiene: clamp_stat(self.hygiene),
            health: clamp_stat(self.health),
        }
    }

    /// Hunger, happiness, energy and hygiene; health is derived from these.
    pub fn care_stats(&self) -> [i64; 4] {
        [self.hunger, self.happiness, self.energy, self.hygiene]
    }

    pub fn in_bounds(&self) -> bool {
        self.care_stats()
            .iter()
            .chain(std::iter::once(&self.health))
            .all(|v| (STAT_MIN..=STAT_MAX).contains(v))
    }
}

/// Mood label shown to players and fed into chat prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Dead,
    Sick,
    Hungry,
    Tired,
    Dirty,
    Sad,
    Happy,
}

impl Mood {
    /// First matching condition wins.
    pub fn from_stats(stats: &Stats, alive: bool) -> Mood {
        if !alive || stats.health <= STAT_MIN {
            Mood::Dead
        } else if stats.health < 30 {
            Mood::Sick
        } else if stats.hunger < 25 {
            Mood::Hungry
        } else if stats.energy < 20 {
            Mood::Tired
        } else if stats.hygiene < 20 {
            Mood::Dirty
        } else if stats.happiness < 30 {
            Mood::Sad
        } else {
            Mood::Happy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Dead => "dead",
            Mood::Sick => "sick",
            Mood::Hungry => "hungry",
            Mood::Tired => "tired",
            Mood::Dirty => "dirty",
            Mood::Sad => "sad",
            Mood::Happy => "happy",
        }
    }
}

impl std::fmt::Display for Mood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a memory log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Action,
    Chat,
    Event,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Action => "action",
            MemoryKind::Chat => "chat",
            MemoryKind::Event => "event",
        }
    }
}

/// Errors surfaced by pet operations. Each maps to one HTTP status in the API layer.
#[derive(Debug, Error)]
pub enum PetError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("could not generate a unique world code after {attempts} attempts")]
    GenerationExhausted { attempts: usize },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Load a pet or fail with `NotFound`.
pub async fn require_pet(db: &Database, pet_id: i64) -> Result<Pet, PetError> {
    db.get_pet(pet_id).await?.ok_or(PetError::NotFound("Pet"))
}

/// Validate and normalise a pet name: trimmed, 1 to `NAME_MAX_CHARS` characters.
pub fn validate_name(raw: &str) -> Result<String, PetError> {
    let name = raw.trim();
    let len = name.chars().count();
    if len == 0 || len > NAME_MAX_CHARS {
        return Err(PetError::Validation(format!(
            "name must be 1-{NAME_MAX_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Get the user's pet, hatching a fresh one on first access.
pub async fn get_or_create(db: &Database, user_id: i64) -> Result<Pet, PetError> {
    if db.get_user(user_id).await?.is_none() {
        return Err(PetError::NotFound("User"));
    }
    let (pet, created) = db.get_or_create_pet(user_id, DEFAULT_PET_NAME).await?;
    if created {
        tracing::info!(pet_id = pet.id, user_id, "Hatched new pet");
        db.add_memory(
            pet.id,
            MemoryKind::Event,
            &format!("{} hatched and met their caretaker for the first time.", pet.name),
        )
        .await?;
    }
    Ok(pet)
}

pub async fn rename(db: &Database, pet_id: i64, raw_name: &str) -> Result<Pet, PetError> {
    let name = validate_name(raw_name)?;
    let before = require_pet(db, pet_id).await?;
    let pet = db
        .rename_pet(pet_id, &name)
        .await?
        .ok_or(PetError::NotFound("Pet"))?;
    if before.name != pet.name {
        db.add_memory(
            pet_id,
            MemoryKind::Event,
            &format!("{} is now called {}.", before.name, pet.name),
        )
        .await?;
    }
    Ok(pet)
}

/// Start a new generation for a pet that has died.
pub async fn restart(db: &Database, pet_id: i64) -> Result<Pet, PetError> {
    let pet = require_pet(db, pet_id).await?;
    if pet.alive {
        return Err(PetError::Validation(format!(
            "{} is still alive and cannot be restarted",
            pet.name
        )));
    }
    let pet = db
        .restart_pet(pet_id, &Stats::FRESH)
        .await?
        .ok_or_else(|| PetError::Conflict("pet was restarted concurrently".to_string()))?;
    db.add_memory(
        pet_id,
        MemoryKind::Event,
        &format!("{} hatched again as generation {}.", pet.name, pet.generation),
    )
    .await?;
    Ok(pet)
}

/// Persist a client-side stat snapshot. Values are clamped before the write;
/// a health of zero marks the pet dead. Syncing a dead pet leaves it untouched.
pub async fn sync_stats(db: &Database, pet_id: i64, stats: Stats) -> Result<Pet, PetError> {
    let stats = stats.clamped();
    match db.sync_pet_stats(pet_id, &stats).await? {
        Some(pet) => {
            if !pet.alive {
                tracing::info!(pet_id, "Pet died");
                db.add_memory(
                    pet_id,
                    MemoryKind::Event,
                    &format!("{} grew too weak and passed away.", pet.name),
                )
                .await?;
            }
            Ok(pet)
        }
        None => require_pet(db, pet_id).await,
    }
}
