/*!
common/src/lib.rs

Shared configuration types and DB helper functions for NewsBalancer.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default and an override config file
- Helpers to initialize and migrate an SQLite database
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsbalancer.db")
    pub path: String,
}

/// Remote LLM service config (OpenAI-compatible chat completions endpoint)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    /// Name of the env var holding the primary API key
    pub api_key_env: Option<String>,
    /// Name of the env var holding the secondary API key used once the primary is exhausted
    pub backup_api_key_env: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

impl LlmConfig {
    pub const DEFAULT_API_URL: &'static str = "https://openrouter.ai/api/v1/chat/completions";

    /// Parsed endpoint, falling back to the OpenRouter chat completions URL.
    pub fn endpoint(&self) -> Result<url::Url> {
        let raw = self.api_url.as_deref().unwrap_or(Self::DEFAULT_API_URL);
        url::Url::parse(raw).with_context(|| format!("Invalid llm.api_url: {}", raw))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(60))
    }
}

/// Scoring engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Path to the versioned perspective document (TOML)
    pub perspectives_path: String,
    /// Maximum number of concurrent model calls within one job
    pub parallelism: Option<usize>,
    pub cache_ttl_seconds: Option<u64>,
    /// How long a finished job stays visible to late subscribers
    pub progress_grace_seconds: Option<u64>,
}

/// HTTP adapter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: Option<LlmConfig>,
    pub scoring: ScoringConfig,
    pub server: Option<ServerConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn llm_or_default(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations from the workspace `migrations` directory against the given pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and opens the database in WAL mode.
/// Pool size is kept small; SQLite serializes writers anyway.
///
/// Example:
///   let pool = init_db_pool("data/newsbalancer.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Single-connection in-memory pool with migrations applied. Used by tests and dry runs.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [database]
        path = "data/test.db"

        [scoring]
        perspectives_path = "config/perspectives.toml"
        parallelism = 2

        [llm]
        api_key_env = "OPENROUTER_API_KEY"
    "#;

    #[test]
    fn parses_minimal_config() {
        let cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        assert_eq!(cfg.scoring.parallelism, Some(2));
        assert!(cfg.server.is_none());

        let llm = cfg.llm_or_default();
        assert_eq!(llm.api_key_env.as_deref(), Some("OPENROUTER_API_KEY"));
        assert_eq!(llm.timeout(), Duration::from_secs(60));
        assert_eq!(llm.endpoint().expect("default url").host_str(), Some("openrouter.ai"));
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        std::fs::write(&default_path, MINIMAL).expect("write default");
        std::fs::write(&override_path, "[scoring]\nparallelism = 8\n").expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("merged config");
        assert_eq!(cfg.scoring.parallelism, Some(8));
        assert_eq!(cfg.scoring.perspectives_path, "config/perspectives.toml");
        assert_eq!(cfg.database.path, "data/test.db");
    }

    #[tokio::test]
    async fn db_pool_on_disk_runs_migrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("scores.db");

        let pool = init_db_pool(&db_path.to_string_lossy()).await.expect("init pool");
        run_migrations(&pool).await.expect("migrate");

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("list tables");
        assert!(tables.contains(&"composite_scores".to_string()));
        assert!(tables.contains(&"perspective_results".to_string()));
    }
}
