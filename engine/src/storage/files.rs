use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::{Collection, Repository, StoreResult};

/// One pretty-printed JSON file per entity, one directory per collection.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for collection in Collection::ALL {
            fs::create_dir_all(root.join(collection.as_str())).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: Collection, id: &str) -> PathBuf {
        self.root
            .join(collection.as_str())
            .join(format!("{}.json", file_stem(id)))
    }
}

/// Percent-encode an entity id into a file stem. The encoding is reversible,
/// so distinct ids never share a file.
fn file_stem(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

#[async_trait]
impl Repository for FileRepository {
    async fn save(&self, collection: Collection, id: &str, document: &Value) -> StoreResult<()> {
        let path = self.path_for(collection, id);
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(document)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!(collection = %collection, id, "Document written");
        Ok(())
    }

    async fn load(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        match fs::read(self.path_for(collection, id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        match fs::remove_file(self.path_for(collection, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, collection: Collection) -> StoreResult<Vec<Value>> {
        let dir = self.root.join(collection.as_str());
        let mut entries = fs::read_dir(&dir).await?;
        let mut paths = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(document) => documents.push(document),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }

        Ok(documents)
    }
}
