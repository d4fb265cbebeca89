use crate::types::{ContentArtifact, PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Keyed persistence of accepted artifacts. Lookups are keyed on both the
/// record id and the prompt hash, so a template or fact change invalidates a
/// stale entry even though the record id is unchanged.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, record_id: &str, prompt_hash: &str) -> Result<Option<ContentArtifact>>;

    /// Stores an artifact, superseding any prior artifact for the record id.
    async fn put(&self, artifact: &ContentArtifact) -> Result<()>;

    async fn has_fresh(&self, record_id: &str, prompt_hash: &str) -> Result<bool>;
}

/// One JSON document per record id under an output directory, plus an
/// in-memory record_id -> prompt_hash index built at open time. Writes to
/// the same record id are serialized through a per-id lock so overlapping
/// regenerations cannot tear a file.
pub struct JsonFileStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, String>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_artifact(&path).await {
                Ok(artifact) => {
                    index.insert(artifact.record_id.clone(), artifact.prompt_hash.clone());
                }
                Err(e) => {
                    // A corrupt file only disables freshness for that record.
                    warn!("Skipping unreadable artifact {}: {}", path.display(), e);
                }
            }
        }

        info!(
            "Opened content store at {} with {} artifacts",
            dir.display(),
            index.len()
        );
        Ok(Self {
            dir,
            index: RwLock::new(index),
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, record_id: &str) -> PathBuf {
        // Record ids come from the dataset; keep the filename safe.
        let safe: String = record_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    async fn lock_for(&self, record_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(record_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn read_artifact(path: &Path) -> Result<ContentArtifact> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
impl ContentStore for JsonFileStore {
    async fn get(&self, record_id: &str, prompt_hash: &str) -> Result<Option<ContentArtifact>> {
        {
            let index = self.index.read().await;
            match index.get(record_id) {
                Some(stored_hash) if stored_hash == prompt_hash => {}
                _ => return Ok(None),
            }
        }

        let artifact = read_artifact(&self.path_for(record_id))
            .await
            .map_err(|e| PipelineError::Store(format!("read {record_id}: {e}")))?;
        if artifact.prompt_hash == prompt_hash {
            Ok(Some(artifact))
        } else {
            Ok(None)
        }
    }

    async fn put(&self, artifact: &ContentArtifact) -> Result<()> {
        let lock = self.lock_for(&artifact.record_id).await;
        let _guard = lock.lock().await;

        let path = self.path_for(&artifact.record_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(artifact)?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| PipelineError::Store(format!("write {}: {e}", artifact.record_id)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PipelineError::Store(format!("commit {}: {e}", artifact.record_id)))?;

        let mut index = self.index.write().await;
        index.insert(artifact.record_id.clone(), artifact.prompt_hash.clone());
        debug!(
            "Stored artifact for record {} ({})",
            artifact.record_id, artifact.prompt_hash
        );
        Ok(())
    }

    async fn has_fresh(&self, record_id: &str, prompt_hash: &str) -> Result<bool> {
        let index = self.index.read().await;
        Ok(index
            .get(record_id)
            .is_some_and(|stored| stored == prompt_hash))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    artifacts: RwLock<HashMap<String, ContentArtifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get(&self, record_id: &str, prompt_hash: &str) -> Result<Option<ContentArtifact>> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts
            .get(record_id)
            .filter(|a| a.prompt_hash == prompt_hash)
            .cloned())
    }

    async fn put(&self, artifact: &ContentArtifact) -> Result<()> {
        let mut artifacts = self.artifacts.write().await;
        artifacts.insert(artifact.record_id.clone(), artifact.clone());
        Ok(())
    }

    async fn has_fresh(&self, record_id: &str, prompt_hash: &str) -> Result<bool> {
        Ok(self.get(record_id, prompt_hash).await?.is_some())
    }
}
