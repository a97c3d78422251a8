// Stat decay applied on every decay tick of a live session.

use super::{Stats, STAT_MIN};

/// Amount subtracted from each stat per decay tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayRates {
    pub hunger: i64,
    pub happiness: i64,
    pub energy: i64,
    pub hygiene: i64,
    /// Health lost on a tick that leaves any care stat at zero.
    pub neglect_health: i64,
}

impl Default for DecayRates {
    fn default() -> Self {
        DecayRates {
            hunger: 2,
            happiness: 1,
            energy: 1,
            hygiene: 1,
            neglect_health: 2,
        }
    }
}

/// One decay tick. Stats floor at zero; a pet with no health left is unchanged.
pub fn decay(stats: Stats, rates: &DecayRates) -> Stats {
    if stats.health <= STAT_MIN {
        return stats;
    }

    let mut next = Stats {
        hunger: stats.hunger - rates.hunger,
        happiness: stats.happiness - rates.happiness,
        energy: stats.energy - rates.energy,
        hygiene: stats.hygiene - rates.hygiene,
        health: stats.health,
    }
    .clamped();

    if next.care_stats().iter().any(|v| *v == STAT_MIN) {
        next.health = (next.health - rates.neglect_health).max(STAT_MIN);
    }
    next
}
