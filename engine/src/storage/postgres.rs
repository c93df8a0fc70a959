use async_trait::async_trait;
use serde_json::Value;
use sqlx::migrate::MigrateDatabase;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use tracing::info;

use super::{Collection, Repository, StoreResult};

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    pub min_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("DB_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = env_parse("DB_MIN_CONNECTIONS") {
            config.min_connections = n;
        }
        if let Some(secs) = env_parse("DB_ACQUIRE_TIMEOUT") {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("DB_IDLE_TIMEOUT") {
            config.idle_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Create the database if needed, open a pool and run migrations.
pub async fn create_pool(database_url: &str, config: &PoolConfig) -> StoreResult<PgPool> {
    if !Postgres::database_exists(database_url).await? {
        Postgres::create_database(database_url).await?;
        info!("Database created successfully");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    info!(
        "Database pool created: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations completed");

    Ok(pool)
}

/// One JSONB row per entity in `workflow_entities`.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, config: PoolConfig) -> StoreResult<Self> {
        Ok(Self::new(create_pool(database_url, &config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn save(&self, collection: Collection, id: &str, document: &Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_entities (collection, id, document, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (collection, id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(Json(document))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        let row: Option<(Json<Value>,)> = sqlx::query_as(
            "SELECT document FROM workflow_entities WHERE collection = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(document),)| document))
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM workflow_entities WHERE collection = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, collection: Collection) -> StoreResult<Vec<Value>> {
        let rows: Vec<(Json<Value>,)> = sqlx::query_as(
            "SELECT document FROM workflow_entities WHERE collection = $1 ORDER BY id",
        )
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(document),)| document).collect())
    }
}
