use anyhow::Context as _;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::PoolConfig;

/// Where engine state is persisted
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    Files { data_dir: PathBuf },
    Postgres { database_url: String, pool: PoolConfig },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageConfig,

    // Resumer
    /// How often due executions are scanned
    pub resume_interval: Duration,
    /// Executions resumed in parallel per scan
    pub resume_concurrency: usize,

    // Actions
    /// Upper bound for one action attempt
    pub action_timeout: Duration,
    /// Pause between retry attempts
    pub retry_delay: Duration,

    // Triggers
    pub trigger_history_limit: usize,

    // Maintenance
    /// Finished executions older than this are purged. 0 keeps them forever.
    pub retention_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,

            // Resumer - scan every minute
            resume_interval: Duration::from_secs(60),
            resume_concurrency: 8,

            action_timeout: Duration::from_secs(30),
            retry_delay: Duration::ZERO,

            trigger_history_limit: 1000,

            retention_days: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let storage = match env::var("LEADFLOW_STORAGE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageConfig::Memory,
            "files" => StorageConfig::Files {
                data_dir: env::var("LEADFLOW_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data")),
            },
            "postgres" => StorageConfig::Postgres {
                database_url: env::var("DATABASE_URL")
                    .context("DATABASE_URL must be set when LEADFLOW_STORAGE=postgres")?,
                pool: PoolConfig::from_env(),
            },
            other => anyhow::bail!("Unknown LEADFLOW_STORAGE backend: {}", other),
        };

        Ok(Self {
            storage,
            resume_interval: Duration::from_secs(parse_or(
                "LEADFLOW_RESUME_INTERVAL_SECS",
                defaults.resume_interval.as_secs(),
            )?),
            resume_concurrency: parse_or("LEADFLOW_RESUME_CONCURRENCY", defaults.resume_concurrency)?.max(1),
            action_timeout: Duration::from_secs(parse_or(
                "LEADFLOW_ACTION_TIMEOUT_SECS",
                defaults.action_timeout.as_secs(),
            )?),
            retry_delay: Duration::from_millis(parse_or("LEADFLOW_RETRY_DELAY_MS", 0u64)?),
            trigger_history_limit: parse_or("LEADFLOW_TRIGGER_HISTORY_LIMIT", defaults.trigger_history_limit)?,
            retention_days: parse_or("LEADFLOW_RETENTION_DAYS", defaults.retention_days)?,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, value)),
        Err(_) => Ok(default),
    }
}
