//! Durable line offsets for interrupted G-code streams.
//!
//! Offsets are written only after the driver acknowledged the line, so the
//! recorded value never runs ahead of what the printer actually received.

use async_trait::async_trait;
use fleet_shared::JobId;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::FleetError;

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load(&self, job: JobId) -> Result<Option<u64>, FleetError>;
    async fn save(&self, job: JobId, line: u64) -> Result<(), FleetError>;
    async fn delete(&self, job: JobId) -> Result<(), FleetError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: Mutex<HashMap<JobId, u64>>,
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self, job: JobId) -> Result<Option<u64>, FleetError> {
        Ok(self.offsets.lock().await.get(&job).copied())
    }

    async fn save(&self, job: JobId, line: u64) -> Result<(), FleetError> {
        self.offsets.lock().await.insert(job, line);
        Ok(())
    }

    async fn delete(&self, job: JobId) -> Result<(), FleetError> {
        self.offsets.lock().await.remove(&job);
        Ok(())
    }
}

/// Keeps every offset in one JSON object, rewritten through a temp file and
/// a rename on each save.
#[derive(Debug)]
pub struct JsonFileOffsetStore {
    path: PathBuf,
    offsets: Mutex<BTreeMap<String, u64>>,
}

impl JsonFileOffsetStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let path = path.as_ref().to_path_buf();
        let offsets = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                FleetError::Storage(format!("corrupt offset file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(FleetError::Storage(e.to_string())),
        };
        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    async fn flush(&self, offsets: &BTreeMap<String, u64>) -> Result<(), FleetError> {
        let bytes =
            serde_json::to_vec_pretty(offsets).map_err(|e| FleetError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| FleetError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| FleetError::Storage(e.to_string()))
    }
}

#[async_trait]
impl OffsetStore for JsonFileOffsetStore {
    async fn load(&self, job: JobId) -> Result<Option<u64>, FleetError> {
        Ok(self.offsets.lock().await.get(&job.to_string()).copied())
    }

    async fn save(&self, job: JobId, line: u64) -> Result<(), FleetError> {
        let mut offsets = self.offsets.lock().await;
        offsets.insert(job.to_string(), line);
        self.flush(&offsets).await
    }

    async fn delete(&self, job: JobId) -> Result<(), FleetError> {
        let mut offsets = self.offsets.lock().await;
        if offsets.remove(&job.to_string()).is_some() {
            self.flush(&offsets).await?;
        }
        Ok(())
    }
}

pub struct ResumableStreamTracker {
    store: Arc<dyn OffsetStore>,
    guard: Mutex<()>,
}

impl std::fmt::Debug for ResumableStreamTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableStreamTracker").finish_non_exhaustive()
    }
}

impl ResumableStreamTracker {
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryOffsetStore::default()))
    }

    /// Records `line` as the last acknowledged offset. Returns `false` when
    /// the value would move the offset backwards and was therefore skipped.
    pub async fn persist_offset(&self, job: JobId, line: u64) -> Result<bool, FleetError> {
        let _serial = self.guard.lock().await;
        if let Some(current) = self.store.load(job).await? {
            if line <= current {
                return Ok(line == current);
            }
        }
        self.store.save(job, line).await?;
        tracing::trace!(%job, line, "offset persisted");
        Ok(true)
    }

    pub async fn offset_for(&self, job: JobId) -> Result<Option<u64>, FleetError> {
        self.store.load(job).await
    }

    pub async fn forget(&self, job: JobId) -> Result<(), FleetError> {
        let _serial = self.guard.lock().await;
        self.store.delete(job).await
    }
}
