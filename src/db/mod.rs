// Database access layer (sqlx `Any` driver: PostgreSQL in production, SQLite in tests).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::pet::{MemoryKind, Mood, Stats};

/// SQL dialect behind the `Any` pool. Only DDL differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Backend {
        if url.starts_with("sqlite:") {
            Backend::Sqlite
        } else {
            Backend::Postgres
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Backend::Postgres => "BIGSERIAL PRIMARY KEY",
            Backend::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }
}

/// Current time as stored in every timestamp column.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub display_name: Option<String>,
    pub created_at: String,
}

/// Raw `pets` row; flags are stored as 0/1 integers for portability.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PetRow {
    id: i64,
    user_id: i64,
    name: String,
    hunger: i64,
    happiness: i64,
    energy: i64,
    hygiene: i64,
    health: i64,
    alive: i64,
    generation: i64,
    world_code: Option<String>,
    world_open: i64,
    visits: i64,
    last_fed_at: Option<String>,
    last_played_at: Option<String>,
    last_cleaned_at: Option<String>,
    last_slept_at: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pet {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(flatten)]
    pub stats: Stats,
    pub alive: bool,
    pub generation: i64,
    pub mood: Mood,
    pub world_code: Option<String>,
    pub world_open: bool,
    pub visits: i64,
    pub last_fed_at: Option<String>,
    pub last_played_at: Option<String>,
    pub last_cleaned_at: Option<String>,
    pub last_slept_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<PetRow> for Pet {
    fn from(row: PetRow) -> Self {
        let stats = Stats {
            hunger: row.hunger,
            happiness: row.happiness,
            energy: row.energy,
            hygiene: row.hygiene,
            health: row.health,
        };
        let alive = row.alive != 0;
        Pet {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            stats,
            alive,
            generation: row.generation,
            mood: Mood::from_stats(&stats, alive),
            world_code: row.world_code,
            world_open: row.world_open != 0,
            visits: row.visits,
            last_fed_at: row.last_fed_at,
            last_played_at: row.last_played_at,
            last_cleaned_at: row.last_cleaned_at,
            last_slept_at: row.last_slept_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Memory {
    pub id: i64,
    pub pet_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Caretaker {
    pub pet_id: i64,
    pub user_id: i64,
    pub username: String,
    pub created_at: String,
}

const PET_COLUMNS: &str = "id, user_id, name, hunger, happiness, energy, hygiene, health, alive, generation, world_code, world_open, visits, last_fed_at, last_played_at, last_cleaned_at, last_slept_at, created_at, updated_at";

const MEMORY_COLUMNS: &str = "id, pet_id, kind, content, created_at";

pub struct Database {
    pool: AnyPool,
    backend: Backend,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();

        let backend = Backend::from_url(database_url);
        // Every connection to `sqlite::memory:` is its own database, so tests
        // must share exactly one connection that is never recycled.
        let options = if database_url.contains(":memory:") {
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            AnyPoolOptions::new().max_connections(10)
        };
        let pool = options.connect(database_url).await?;

        let db = Self { pool, backend };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        let id = self.backend.id_column();

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id {id},
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT,
                display_name TEXT,
                created_at TEXT NOT NULL
            )
        "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS pets (
                id {id},
                user_id BIGINT NOT NULL UNIQUE REFERENCES users(id),
                name TEXT NOT NULL,
                hunger BIGINT NOT NULL,
                happiness BIGINT NOT NULL,
                energy BIGINT NOT NULL,
                hygiene BIGINT NOT NULL,
                health BIGINT NOT NULL,
                alive BIGINT NOT NULL DEFAULT 1,
                generation BIGINT NOT NULL DEFAULT 1,
                world_code TEXT UNIQUE,
                world_open BIGINT NOT NULL DEFAULT 0,
                visits BIGINT NOT NULL DEFAULT 0,
                last_fed_at TEXT,
                last_played_at TEXT,
                last_cleaned_at TEXT,
                last_slept_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id {id},
                pet_id BIGINT NOT NULL REFERENCES pets(id),
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_pet ON memories (pet_id, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS pet_caretakers (
                id {id},
                pet_id BIGINT NOT NULL REFERENCES pets(id),
                user_id BIGINT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                UNIQUE(pet_id, user_id)
            )
        "#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (username, email, password_hash, display_name, created_at) VALUES ($1, $2, $3, $4, $5) RETURNING id, username, email, password_hash, display_name, created_at",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(display_name)
        .bind(now())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, display_name, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, display_name, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
    }

    // ── Pets ──────────────────────────────────────────────────────────

    pub async fn get_pet(&self, id: i64) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "SELECT {PET_COLUMNS} FROM pets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    pub async fn get_pet_by_user(&self, user_id: i64) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "SELECT {PET_COLUMNS} FROM pets WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    pub async fn create_pet(
        &self,
        user_id: i64,
        name: &str,
        stats: &Stats,
    ) -> Result<Pet, sqlx::Error> {
        let ts = now();
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "INSERT INTO pets (user_id, name, hunger, happiness, energy, hygiene, health, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {PET_COLUMNS}"
        ))
        .bind(user_id)
        .bind(name)
        .bind(stats.hunger)
        .bind(stats.happiness)
        .bind(stats.energy)
        .bind(stats.hygiene)
        .bind(stats.health)
        .bind(&ts)
        .bind(&ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Return the user's pet, creating it with fresh stats if missing.
    /// The boolean is true when a pet was created by this call.
    pub async fn get_or_create_pet(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<(Pet, bool), sqlx::Error> {
        if let Some(pet) = self.get_pet_by_user(user_id).await? {
            return Ok((pet, false));
        }
        match self.create_pet(user_id, name, &Stats::FRESH).await {
            Ok(pet) => Ok((pet, true)),
            // Another request hatched it first
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let pet = self
                    .get_pet_by_user(user_id)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok((pet, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Write post-action stats and stamp the action's timestamp column.
    /// `timestamp_column` must come from the fixed action table.
    pub async fn record_action(
        &self,
        pet_id: i64,
        stats: &Stats,
        timestamp_column: &'static str,
    ) -> Result<Option<Pet>, sqlx::Error> {
        let ts = now();
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET hunger = $1, happiness = $2, energy = $3, hygiene = $4, health = $5, {timestamp_column} = $6, updated_at = $7 WHERE id = $8 RETURNING {PET_COLUMNS}"
        ))
        .bind(stats.hunger)
        .bind(stats.happiness)
        .bind(stats.energy)
        .bind(stats.hygiene)
        .bind(stats.health)
        .bind(&ts)
        .bind(&ts)
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    /// Overwrite the stats of a living pet; zero health marks it dead.
    /// Returns `None` if the pet does not exist or is already dead.
    pub async fn sync_pet_stats(
        &self,
        pet_id: i64,
        stats: &Stats,
    ) -> Result<Option<Pet>, sqlx::Error> {
        let alive: i64 = if stats.health > 0 { 1 } else { 0 };
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET hunger = $1, happiness = $2, energy = $3, hygiene = $4, health = $5, alive = $6, updated_at = $7 WHERE id = $8 AND alive = 1 RETURNING {PET_COLUMNS}"
        ))
        .bind(stats.hunger)
        .bind(stats.happiness)
        .bind(stats.energy)
        .bind(stats.hygiene)
        .bind(stats.health)
        .bind(alive)
        .bind(now())
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    pub async fn rename_pet(&self, pet_id: i64, name: &str) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET name = $1, updated_at = $2 WHERE id = $3 RETURNING {PET_COLUMNS}"
        ))
        .bind(name)
        .bind(now())
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    /// Start a new generation for a dead pet. Its world is closed.
    pub async fn restart_pet(
        &self,
        pet_id: i64,
        stats: &Stats,
    ) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET hunger = $1, happiness = $2, energy = $3, hygiene = $4, health = $5, alive = 1, generation = generation + 1, world_code = NULL, world_open = 0, updated_at = $6 WHERE id = $7 AND alive = 0 RETURNING {PET_COLUMNS}"
        ))
        .bind(stats.hunger)
        .bind(stats.happiness)
        .bind(stats.energy)
        .bind(stats.hygiene)
        .bind(stats.health)
        .bind(now())
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    // ── Worlds ────────────────────────────────────────────────────────

    pub async fn world_code_exists(&self, code: &str) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pets WHERE world_code = $1")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn set_world_code(&self, pet_id: i64, code: &str) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET world_code = $1, world_open = 1, updated_at = $2 WHERE id = $3 RETURNING {PET_COLUMNS}"
        ))
        .bind(code)
        .bind(now())
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    pub async fn clear_world_code(&self, pet_id: i64) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET world_code = NULL, world_open = 0, updated_at = $1 WHERE id = $2 RETURNING {PET_COLUMNS}"
        ))
        .bind(now())
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    /// Count a visit to an open world. `None` if no open world has this code.
    pub async fn visit_world(&self, code: &str) -> Result<Option<Pet>, sqlx::Error> {
        let row = sqlx::query_as::<_, PetRow>(&format!(
            "UPDATE pets SET visits = visits + 1 WHERE world_code = $1 AND world_open = 1 RETURNING {PET_COLUMNS}"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Pet::from))
    }

    pub async fn list_open_worlds(&self, limit: i64) -> Result<Vec<Pet>, sqlx::Error> {
        let rows = sqlx::query_as::<_, PetRow>(&format!(
            "SELECT {PET_COLUMNS} FROM pets WHERE world_open = 1 AND world_code IS NOT NULL ORDER BY visits DESC, id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Pet::from).collect())
    }

    // ── Memories ──────────────────────────────────────────────────────

    pub async fn add_memory(
        &self,
        pet_id: i64,
        kind: MemoryKind,
        content: &str,
    ) -> Result<Memory, sqlx::Error> {
        sqlx::query_as::<_, Memory>(&format!(
            "INSERT INTO memories (pet_id, kind, content, created_at) VALUES ($1, $2, $3, $4) RETURNING {MEMORY_COLUMNS}"
        ))
        .bind(pet_id)
        .bind(kind.as_str())
        .bind(content)
        .bind(now())
        .fetch_one(&self.pool)
        .await
    }

    /// Most recent memories first.
    pub async fn recent_memories(&self, pet_id: i64, limit: i64) -> Result<Vec<Memory>, sqlx::Error> {
        sqlx::query_as::<_, Memory>(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE pet_id = $1 ORDER BY id DESC LIMIT $2"
        ))
        .bind(pet_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    // ── Caretakers ────────────────────────────────────────────────────

    pub async fn add_caretaker(&self, pet_id: i64, user_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO pet_caretakers (pet_id, user_id, created_at) VALUES ($1, $2, $3)")
            .bind(pet_id)
            .bind(user_id)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_caretaker(&self, pet_id: i64, user_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM pet_caretakers WHERE pet_id = $1 AND user_id = $2")
            .bind(pet_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_caretaker(&self, pet_id: i64, user_id: i64) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pet_caretakers WHERE pet_id = $1 AND user_id = $2",
        )
        .bind(pet_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn list_caretakers(&self, pet_id: i64) -> Result<Vec<Caretaker>, sqlx::Error> {
        sqlx::query_as::<_, Caretaker>(
            "SELECT c.pet_id, c.user_id, u.username, c.created_at FROM pet_caretakers c JOIN users u ON u.id = c.user_id WHERE c.pet_id = $1 ORDER BY c.id",
        )
        .bind(pet_id)
        .fetch_all(&self.pool)
        .await
    }
}
