// Multiplayer worlds: shareable join codes and visiting.
//
// Codes look like `K7QX-M3`: six characters from an alphabet without the easily
// confused `0`, `1`, `O` and `I`. A code exists only while its world is open.

use rand::Rng;
use serde::Serialize;

use super::{require_pet, MemoryKind, Mood, PetError, Stats};
use crate::db::{Database, Pet};
use crate::metrics;

pub const WORLD_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const MAX_CODE_ATTEMPTS: usize = 100;
pub const OPEN_WORLDS_LIMIT: i64 = 50;

const CODE_HEAD_LEN: usize = 4;
const CODE_TAIL_LEN: usize = 2;

/// What a visitor sees of someone else's pet.
#[derive(Debug, Clone, Serialize)]
pub struct WorldView {
    pub world_code: String,
    pub name: String,
    pub generation: i64,
    pub alive: bool,
    pub mood: Mood,
    pub stats: Stats,
    pub visits: i64,
}

impl WorldView {
    fn from_pet(pet: Pet) -> Option<WorldView> {
        Some(WorldView {
            world_code: pet.world_code?,
            name: pet.name,
            generation: pet.generation,
            alive: pet.alive,
            mood: pet.mood,
            stats: pet.stats,
            visits: pet.visits,
        })
    }
}

/// Generate a candidate code in `XXXX-XX` form.
pub fn generate_world_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(CODE_HEAD_LEN + CODE_TAIL_LEN + 1);
    for i in 0..CODE_HEAD_LEN + CODE_TAIL_LEN {
        if i == CODE_HEAD_LEN {
            code.push('-');
        }
        let idx = rng.gen_range(0..WORLD_CODE_ALPHABET.len());
        code.push(WORLD_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Normalise user input (case, whitespace, missing hyphen) to canonical form.
/// Returns `None` when the input cannot be a world code.
pub fn normalize_code(input: &str) -> Option<String> {
    let chars: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if chars.len() != CODE_HEAD_LEN + CODE_TAIL_LEN {
        return None;
    }
    if !chars
        .iter()
        .all(|c| c.is_ascii() && WORLD_CODE_ALPHABET.contains(&(*c as u8)))
    {
        return None;
    }

    let mut code: String = chars[..CODE_HEAD_LEN].iter().collect();
    code.push('-');
    code.extend(&chars[CODE_HEAD_LEN..]);
    Some(code)
}

/// Open (or re-open) a pet's world under a freshly generated code.
///
/// Every pet's current code counts as taken, including this pet's own, so a
/// re-open always moves the world to a new code and the old one stops resolving.
/// The UNIQUE constraint on `world_code` backs up the existence check: a
/// violation on write is treated as another collision.
pub async fn open_world<R: Rng + Send>(
    db: &Database,
    pet_id: i64,
    rng: &mut R,
    max_attempts: usize,
) -> Result<Pet, PetError> {
    let pet = require_pet(db, pet_id).await?;
    let was_open = pet.world_open;

    for attempt in 1..=max_attempts {
        let code = generate_world_code(rng);
        if db.world_code_exists(&code).await? {
            tracing::debug!(pet_id, attempt, code = %code, "World code collision");
            continue;
        }

        match db.set_world_code(pet_id, &code).await {
            Ok(Some(pet)) => {
                metrics::WORLD_OPENS_TOTAL.inc();
                tracing::info!(pet_id, code = %code, attempt, "World opened");
                let line = if was_open {
                    format!("{} moved their world to a new code.", pet.name)
                } else {
                    format!("{} opened their world to visitors.", pet.name)
                };
                db.add_memory(pet_id, MemoryKind::Event, &line).await?;
                return Ok(pet);
            }
            Ok(None) => return Err(PetError::NotFound("Pet")),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tracing::warn!(pet_id, attempt, code = %code, "World code taken concurrently");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::error!(pet_id, max_attempts, "World code generation exhausted");
    Err(PetError::GenerationExhausted {
        attempts: max_attempts,
    })
}

/// Close a pet's world. Closing an already-closed world is a no-op.
pub async fn close_world(db: &Database, pet_id: i64) -> Result<Pet, PetError> {
    let before = require_pet(db, pet_id).await?;
    let pet = db
        .clear_world_code(pet_id)
        .await?
        .ok_or(PetError::NotFound("Pet"))?;
    if before.world_open {
        tracing::info!(pet_id, "World closed");
        db.add_memory(
            pet_id,
            MemoryKind::Event,
            &format!("{} closed their world.", pet.name),
        )
        .await?;
    }
    Ok(pet)
}

/// Visit an open world by code, counting the visit.
pub async fn visit_world(db: &Database, raw_code: &str) -> Result<WorldView, PetError> {
    let code = normalize_code(raw_code).ok_or(PetError::NotFound("World"))?;
    let pet = db
        .visit_world(&code)
        .await?
        .ok_or(PetError::NotFound("World"))?;

    metrics::WORLD_VISITS_TOTAL.inc();
    db.add_memory(
        pet.id,
        MemoryKind::Event,
        &format!("{} had a visitor!", pet.name),
    )
    .await?;

    WorldView::from_pet(pet).ok_or(PetError::NotFound("World"))
}

/// Open worlds, most visited first.
pub async fn list_open_worlds(db: &Database) -> Result<Vec<WorldView>, PetError> {
    let pets = db.list_open_worlds(OPEN_WORLDS_LIMIT).await?;
    Ok(pets.into_iter().filter_map(WorldView::from_pet).collect())
}
