//! Queue entry storage.
//!
//! Ordering contract for [`QueueRepository::next_queued`]: highest priority
//! first, then oldest `created_at`, then submission order. A requeued entry
//! keeps its original position in that order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_shared::{QueueEntryId, QueueStatus};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::FleetError;
use crate::model::QueueEntry;

#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn insert(&self, entry: QueueEntry) -> Result<(), FleetError>;

    async fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, FleetError>;

    /// Replaces a stored entry. Fails with `NotFound` if it was never inserted.
    async fn update(&self, entry: QueueEntry) -> Result<(), FleetError>;

    /// Head of the queue among `QUEUED` entries.
    async fn next_queued(&self) -> Result<Option<QueueEntry>, FleetError>;

    async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueEntry>, FleetError>;

    /// All entries in submission order.
    async fn list(&self) -> Result<Vec<QueueEntry>, FleetError>;

    async fn remove(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, FleetError>;

    async fn count_by_status(&self, status: QueueStatus) -> Result<usize, FleetError> {
        Ok(self.list_by_status(status).await?.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueOrderKey {
    priority: Reverse<u8>,
    created_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug)]
struct Stored {
    entry: QueueEntry,
    seq: u64,
}

impl Stored {
    fn key(&self) -> QueueOrderKey {
        QueueOrderKey {
            priority: Reverse(self.entry.priority),
            created_at: self.entry.created_at,
            seq: self.seq,
        }
    }
}

#[derive(Debug, Default)]
struct RepoState {
    entries: HashMap<QueueEntryId, Stored>,
    queued: BTreeMap<QueueOrderKey, QueueEntryId>,
    next_seq: u64,
}

/// In-memory repository with an ordered index over `QUEUED` entries.
#[derive(Debug, Default)]
pub struct InMemoryQueueRepository {
    state: RwLock<RepoState>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn insert(&self, entry: QueueEntry) -> Result<(), FleetError> {
        let mut state = self.state.write().await;
        if state.entries.contains_key(&entry.id) {
            return Err(FleetError::Conflict(format!("queue entry {} already exists", entry.id)));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let stored = Stored { entry, seq };
        if stored.entry.status == QueueStatus::Queued {
            state.queued.insert(stored.key(), stored.entry.id);
        }
        state.entries.insert(stored.entry.id, stored);
        Ok(())
    }

    async fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, FleetError> {
        Ok(self.state.read().await.entries.get(&id).map(|s| s.entry.clone()))
    }

    async fn update(&self, entry: QueueEntry) -> Result<(), FleetError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let stored = state
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| FleetError::not_found("queue entry", entry.id))?;
        state.queued.remove(&stored.key());
        stored.entry = entry;
        if stored.entry.status == QueueStatus::Queued {
            state.queued.insert(stored.key(), stored.entry.id);
        }
        Ok(())
    }

    async fn next_queued(&self) -> Result<Option<QueueEntry>, FleetError> {
        let state = self.state.read().await;
        Ok(state
            .queued
            .values()
            .next()
            .and_then(|id| state.entries.get(id))
            .map(|s| s.entry.clone()))
    }

    async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueEntry>, FleetError> {
        let state = self.state.read().await;
        let mut found: Vec<&Stored> = state
            .entries
            .values()
            .filter(|s| s.entry.status == status)
            .collect();
        found.sort_by_key(|s| s.seq);
        Ok(found.into_iter().map(|s| s.entry.clone()).collect())
    }

    async fn list(&self) -> Result<Vec<QueueEntry>, FleetError> {
        let state = self.state.read().await;
        let mut all: Vec<&Stored> = state.entries.values().collect();
        all.sort_by_key(|s| s.seq);
        Ok(all.into_iter().map(|s| s.entry.clone()).collect())
    }

    async fn remove(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, FleetError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.entries.remove(&id) else {
            return Ok(None);
        };
        state.queued.remove(&stored.key());
        Ok(Some(stored.entry))
    }

    async fn count_by_status(&self, status: QueueStatus) -> Result<usize, FleetError> {
        let state = self.state.read().await;
        if status == QueueStatus::Queued {
            return Ok(state.queued.len());
        }
        Ok(state.entries.values().filter(|s| s.entry.status == status).count())
    }
}
