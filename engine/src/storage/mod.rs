// Persistence layer
//
// Entities are stored as JSON documents keyed by (collection, id). The engine
// only ever needs whole-document writes and full collection scans, so every
// backend implements the same small Repository trait.

pub mod files;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::StorageConfig;

pub use files::FileRepository;
pub use memory::MemoryRepository;
pub use postgres::{PgRepository, PoolConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// Current definition per workflow id
    Workflows,
    /// Published snapshots, keyed "{workflow_id}.v{version}"
    WorkflowVersions,
    Triggers,
    /// Per-subject fire history, keyed by subject id
    TriggerHistory,
    Executions,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Workflows,
        Collection::WorkflowVersions,
        Collection::Triggers,
        Collection::TriggerHistory,
        Collection::Executions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflows => "workflows",
            Self::WorkflowVersions => "workflow_versions",
            Self::Triggers => "triggers",
            Self::TriggerHistory => "trigger_history",
            Self::Executions => "executions",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert or replace a document.
    async fn save(&self, collection: Collection, id: &str, document: &Value) -> StoreResult<()>;

    async fn load(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>>;

    /// Returns whether a document was removed.
    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool>;

    /// Every document in a collection, ordered by id.
    async fn query(&self, collection: Collection) -> StoreResult<Vec<Value>>;
}

pub type SharedRepository = Arc<dyn Repository>;

pub async fn save_entity<T: Serialize>(
    repo: &dyn Repository,
    collection: Collection,
    id: &str,
    entity: &T,
) -> StoreResult<()> {
    let document = serde_json::to_value(entity)?;
    repo.save(collection, id, &document).await
}

pub async fn load_entity<T: DeserializeOwned>(
    repo: &dyn Repository,
    collection: Collection,
    id: &str,
) -> StoreResult<Option<T>> {
    match repo.load(collection, id).await? {
        Some(document) => Ok(Some(serde_json::from_value(document)?)),
        None => Ok(None),
    }
}

pub async fn load_all<T: DeserializeOwned>(
    repo: &dyn Repository,
    collection: Collection,
) -> StoreResult<Vec<T>> {
    repo.query(collection)
        .await?
        .into_iter()
        .map(|document| serde_json::from_value(document).map_err(StoreError::from))
        .collect()
}

/// Build the repository selected by configuration.
pub async fn connect(config: &StorageConfig) -> StoreResult<SharedRepository> {
    match config {
        StorageConfig::Memory => {
            info!("Using in-memory storage; state will not survive a restart");
            Ok(Arc::new(MemoryRepository::new()))
        }
        StorageConfig::Files { data_dir } => {
            info!(data_dir = %data_dir.display(), "Using file storage");
            Ok(Arc::new(FileRepository::open(data_dir).await?))
        }
        StorageConfig::Postgres { database_url, pool } => {
            let repo = PgRepository::connect(database_url, pool.clone()).await?;
            Ok(Arc::new(repo))
        }
    }
}
