// Care actions: the fixed stat delta table and its application to stored pets.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{clamp_stat, require_pet, MemoryKind, PetError, Stats};
use crate::db::{Database, Pet};
use crate::metrics;

/// Health regained by an action that leaves every care stat at or above this level.
const WELL_CARED_THRESHOLD: i64 = 50;
const WELL_CARED_HEALTH_BONUS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Feed,
    Play,
    Clean,
    Sleep,
}

/// Signed change applied to each care stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatDelta {
    pub hunger: i64,
    pub happiness: i64,
    pub energy: i64,
    pub hygiene: i64,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Feed, Action::Play, Action::Clean, Action::Sleep];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Feed => "feed",
            Action::Play => "play",
            Action::Clean => "clean",
            Action::Sleep => "sleep",
        }
    }

    pub fn delta(self) -> StatDelta {
        match self {
            Action::Feed => StatDelta {
                hunger: 30,
                ..StatDelta::default()
            },
            Action::Play => StatDelta {
                happiness: 20,
                energy: -10,
                ..StatDelta::default()
            },
            Action::Clean => StatDelta {
                hygiene: 40,
                ..StatDelta::default()
            },
            Action::Sleep => StatDelta {
                energy: 30,
                ..StatDelta::default()
            },
        }
    }

    /// Column stamped with the time this action was last performed.
    pub fn timestamp_column(self) -> &'static str {
        match self {
            Action::Feed => "last_fed_at",
            Action::Play => "last_played_at",
            Action::Clean => "last_cleaned_at",
            Action::Sleep => "last_slept_at",
        }
    }

    /// Apply the delta and clamp every stat to the valid range.
    pub fn apply(self, stats: Stats) -> Stats {
        let delta = self.delta();
        let mut next = Stats {
            hunger: stats.hunger + delta.hunger,
            happiness: stats.happiness + delta.happiness,
            energy: stats.energy + delta.energy,
            hygiene: stats.hygiene + delta.hygiene,
            health: stats.health,
        }
        .clamped();

        if next
            .care_stats()
            .iter()
            .all(|v| *v >= WELL_CARED_THRESHOLD)
        {
            next.health = clamp_stat(next.health + WELL_CARED_HEALTH_BONUS);
        }
        next
    }

    /// Natural-language line recorded in the memory log.
    pub fn describe(self, name: &str) -> String {
        match self {
            Action::Feed => format!("{name} was fed a tasty meal."),
            Action::Play => format!("{name} played a game and had lots of fun."),
            Action::Clean => format!("{name} had a bath and is squeaky clean."),
            Action::Sleep => format!("{name} took a long, cosy nap."),
        }
    }
}

impl FromStr for Action {
    type Err = PetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" => Ok(Action::Feed),
            "play" => Ok(Action::Play),
            "clean" => Ok(Action::Clean),
            "sleep" => Ok(Action::Sleep),
            other => Err(PetError::Validation(format!(
                "unknown action '{other}', expected one of feed, play, clean, sleep"
            ))),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply an action to a stored pet, persist the result and log a memory.
pub async fn apply_action(db: &Database, pet_id: i64, action: Action) -> Result<Pet, PetError> {
    let pet = require_pet(db, pet_id).await?;
    if !pet.alive {
        return Err(PetError::Validation(format!(
            "{} is not alive; restart to hatch a new generation",
            pet.name
        )));
    }

    let stats = action.apply(pet.stats);
    let updated = db
        .record_action(pet_id, &stats, action.timestamp_column())
        .await?
        .ok_or(PetError::NotFound("Pet"))?;

    db.add_memory(pet_id, MemoryKind::Action, &action.describe(&updated.name))
        .await?;

    metrics::PET_ACTIONS_TOTAL
        .with_label_values(&[action.as_str()])
        .inc();
    tracing::debug!(pet_id, action = %action, "Applied pet action");

    Ok(updated)
}
