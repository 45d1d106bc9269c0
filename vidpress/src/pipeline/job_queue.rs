//! Durable FIFO job queue.
//!
//! Every entry is persisted before it becomes visible in the in-memory
//! mirror, and the mirror is rebuilt from the store on startup. Entries stay
//! in the store while their job runs; the pipeline deletes them on any
//! terminal outcome.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::Result;
use crate::database::StoreHealth;
use crate::database::models::QueueEntryDbModel;
use crate::database::repositories::QueueRepository;

pub struct JobQueue {
    repository: Arc<dyn QueueRepository>,
    health: StoreHealth,
    /// Entries not yet picked up by a worker, in submission order.
    waiting: Mutex<VecDeque<QueueEntryDbModel>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(repository: Arc<dyn QueueRepository>, health: StoreHealth) -> Self {
        Self {
            repository,
            health,
            waiting: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever work is added.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn health(&self) -> &StoreHealth {
        &self.health
    }

    /// Persist `entry` and make it available to workers.
    pub async fn enqueue(&self, entry: QueueEntryDbModel) -> Result<()> {
        self.health.check()?;
        self.health.observe(self.repository.insert(&entry).await)?;

        debug!(entry_id = %entry.id, owner_id = entry.owner_id, "Enqueued {}", entry.display_name);
        self.waiting.lock().push_back(entry);
        self.notify.notify_one();
        Ok(())
    }

    /// Rebuild the in-memory mirror from the store, in `submitted_at` order.
    pub async fn recover(&self) -> Result<usize> {
        let entries = self.health.observe(self.repository.list_all().await)?;
        let count = entries.len();

        *self.waiting.lock() = entries.into();
        if count > 0 {
            self.notify.notify_one();
        }

        info!("Recovered {} queued jobs from database", count);
        Ok(count)
    }

    /// Take the next waiting entry.
    pub fn pop(&self) -> Option<QueueEntryDbModel> {
        self.waiting.lock().pop_front()
    }

    /// Put an entry back at the head, e.g. when it could not be checked
    /// against the store.
    pub fn requeue_front(&self, entry: QueueEntryDbModel) {
        self.waiting.lock().push_front(entry);
        self.notify.notify_one();
    }

    /// Whether the entry still exists in the store.
    pub async fn still_queued(&self, entry_id: &str) -> Result<bool> {
        self.health.observe(self.repository.exists(entry_id).await)
    }

    /// Delete an entry from the store and the mirror.
    pub async fn remove(&self, entry_id: &str) -> Result<bool> {
        self.waiting.lock().retain(|e| e.id != entry_id);
        self.health.observe(self.repository.delete(entry_id).await)
    }

    /// Stored entries of `owner_id`, running ones included.
    pub async fn count_for_owner(&self, owner_id: i64) -> Result<usize> {
        let count = self
            .health
            .observe(self.repository.count_for_owner(owner_id).await)?;
        Ok(count.max(0) as usize)
    }

    pub async fn counts_by_owner(&self) -> Result<Vec<(i64, i64)>> {
        self.health.observe(self.repository.counts_by_owner().await)
    }

    /// Entries not yet started, in order.
    pub fn waiting(&self) -> Vec<QueueEntryDbModel> {
        self.waiting.lock().iter().cloned().collect()
    }

    /// Entries of `owner_id` not yet started, in order.
    pub fn waiting_for_owner(&self, owner_id: i64) -> Vec<QueueEntryDbModel> {
        self.waiting
            .lock()
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Withdraw the owner's `position`-th waiting entry (1-based).
    pub async fn withdraw(&self, owner_id: i64, position: usize) -> Result<Option<QueueEntryDbModel>> {
        let Some(entry) = position
            .checked_sub(1)
            .and_then(|idx| self.waiting_for_owner(owner_id).into_iter().nth(idx))
        else {
            return Ok(None);
        };

        self.remove(&entry.id).await?;
        info!(entry_id = %entry.id, owner_id, "Withdrew queued job {}", entry.display_name);
        Ok(Some(entry))
    }

    /// Withdraw every waiting entry of `owner_id`.
    pub async fn withdraw_all(&self, owner_id: i64) -> Result<usize> {
        let entries = self.waiting_for_owner(owner_id);
        for entry in &entries {
            self.remove(&entry.id).await?;
        }
        Ok(entries.len())
    }

    /// Remove the `position`-th waiting entry across all owners (1-based).
    pub async fn remove_position(&self, position: usize) -> Result<Option<QueueEntryDbModel>> {
        let entry = position
            .checked_sub(1)
            .and_then(|idx| self.waiting.lock().get(idx).cloned());
        let Some(entry) = entry else {
            return Ok(None);
        };

        self.remove(&entry.id).await?;
        Ok(Some(entry))
    }

    /// Remove every waiting entry. Running jobs are unaffected.
    pub async fn purge(&self) -> Result<usize> {
        let entries = self.waiting();
        for entry in &entries {
            self.remove(&entry.id).await?;
        }
        info!("Purged {} queued jobs", entries.len());
        Ok(entries.len())
    }

    pub fn depth(&self) -> usize {
        self.waiting.lock().len()
    }
}
