// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`postgres://...` in production, `sqlite::memory:` for tests).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Base URL of the Ollama server. Chat uses canned replies when unset.
    pub ollama_url: Option<String>,
    /// Model name passed to Ollama.
    pub ollama_model: String,
    /// Timeout for a single LLM call.
    pub llm_timeout: Duration,
    /// How often a live session decays its pet's stats.
    pub decay_interval: Duration,
    /// How often a live session pushes its snapshot to the database.
    pub sync_interval: Duration,
    /// Directory containing pre-built frontend files to serve.
    pub static_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "postgres://localhost/tamagotchi".to_string(),
            port: 3000,
            ollama_url: None,
            ollama_model: "llama3.2".to_string(),
            llm_timeout: Duration::from_secs(10),
            decay_interval: Duration::from_secs(60),
            sync_interval: Duration::from_secs(10),
            static_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - connection string (default: `postgres://localhost/tamagotchi`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `OLLAMA_URL` - Ollama base URL, e.g. `http://localhost:11434`
    /// - `OLLAMA_MODEL` - model name (default: `llama3.2`)
    /// - `LLM_TIMEOUT_SECS` - chat timeout (default: 10)
    /// - `DECAY_INTERVAL_SECS` / `SYNC_INTERVAL_SECS` - session timers (60 / 10)
    /// - `STATIC_DIR` - Path to frontend dist directory for static file serving
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let defaults = Config::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.port);

        let ollama_url = std::env::var("OLLAMA_URL")
            .ok()
            .map(|v| v.trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        let ollama_model = std::env::var("OLLAMA_MODEL").unwrap_or(defaults.ollama_model);

        let llm_timeout = Self::env_secs("LLM_TIMEOUT_SECS").unwrap_or(defaults.llm_timeout);
        let decay_interval =
            Self::env_secs("DECAY_INTERVAL_SECS").unwrap_or(defaults.decay_interval);
        let sync_interval = Self::env_secs("SYNC_INTERVAL_SECS").unwrap_or(defaults.sync_interval);

        let static_dir = std::env::var("STATIC_DIR").ok().map(PathBuf::from);

        Config {
            database_url,
            port,
            ollama_url,
            ollama_model,
            llm_timeout,
            decay_interval,
            sync_interval,
            static_dir,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }

    fn env_secs(name: &str) -> Option<Duration> {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
