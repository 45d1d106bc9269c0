//! Admission handshake: confirmation requests gate entry into the queue.
//!
//! A submission first becomes a short-lived confirmation. Only when the owner
//! confirms it, and only if they are still entitled and below their queue
//! limit at that moment, does it become a queue entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AdmissionConfig;
use crate::database::StoreHealth;
use crate::database::models::{ConfirmationDbModel, QueueEntryDbModel};
use crate::database::repositories::{ConfirmationRepository, OwnerRepository};
use crate::database::time::{is_expired, now_ms};
use crate::domain::Entitlement;
use crate::pipeline::JobQueue;
use crate::{Error, Result};

/// Why a submission or confirmation was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("no active plan")]
    NoEntitlement,
    #[error("a pending confirmation must be resolved first")]
    PendingConfirmation,
    #[error("queue limit reached ({queued}/{limit})")]
    QueueLimitReached { queued: usize, limit: usize },
    #[error("confirmation expired")]
    ConfirmationExpired,
    #[error("confirmation not found")]
    ConfirmationNotFound,
}

/// A video received from an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSubmission {
    pub owner_id: i64,
    pub chat_ref: i64,
    pub message_ref: i64,
    pub source_ref: String,
    pub display_name: String,
}

/// Result of confirming a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(QueueEntryDbModel),
    Rejected(RejectReason),
}

pub struct AdmissionService {
    confirmations: Arc<dyn ConfirmationRepository>,
    owners: Arc<dyn OwnerRepository>,
    queue: Arc<JobQueue>,
    health: StoreHealth,
    config: AdmissionConfig,
    /// Serialises confirmations so concurrent ones cannot exceed a queue limit.
    confirm_lock: tokio::sync::Mutex<()>,
}

impl AdmissionService {
    pub fn new(
        confirmations: Arc<dyn ConfirmationRepository>,
        owners: Arc<dyn OwnerRepository>,
        queue: Arc<JobQueue>,
        health: StoreHealth,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            confirmations,
            owners,
            queue,
            health,
            config,
            confirm_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_admin(&self, owner_id: i64) -> bool {
        self.config.admin_ids.contains(&owner_id)
    }

    pub async fn entitlement(&self, owner_id: i64) -> Result<Entitlement> {
        let owner = self.health.observe(self.owners.get(owner_id).await)?;
        Ok(Entitlement::resolve(
            owner.as_ref(),
            self.is_admin(owner_id),
            now_ms(),
        ))
    }

    fn ttl_ms(&self) -> i64 {
        self.config.confirmation_ttl.as_millis() as i64
    }

    /// Open a confirmation for `submission` and return its id.
    pub async fn request_confirmation(&self, submission: MediaSubmission) -> Result<String> {
        self.health.check()?;

        if !self.entitlement(submission.owner_id).await?.is_entitled() {
            return Err(Error::AdmissionRejected(RejectReason::NoEntitlement));
        }

        let now = now_ms();
        let existing = self
            .health
            .observe(self.confirmations.list_for_owner(submission.owner_id).await)?;
        let mut pending = false;
        for confirmation in existing {
            if is_expired(confirmation.created_at, self.ttl_ms(), now) {
                self.health
                    .observe(self.confirmations.delete(&confirmation.id).await)?;
            } else {
                pending = true;
            }
        }
        if pending {
            return Err(Error::AdmissionRejected(RejectReason::PendingConfirmation));
        }

        let confirmation = ConfirmationDbModel::new(
            submission.owner_id,
            submission.chat_ref,
            submission.message_ref,
            submission.source_ref,
            submission.display_name,
        );
        self.health
            .observe(self.confirmations.replace_for_owner(&confirmation).await)?;

        debug!(
            owner_id = confirmation.owner_id,
            "Confirmation {} opened for {}", confirmation.id, confirmation.display_name
        );
        Ok(confirmation.id)
    }

    /// Accept a confirmation if it is live and the owner still has room.
    /// The confirmation is consumed either way.
    pub async fn confirm(&self, confirmation_id: &str) -> Result<Admission> {
        self.health.check()?;
        let _guard = self.confirm_lock.lock().await;

        let Some(confirmation) = self
            .health
            .observe(self.confirmations.get(confirmation_id).await)?
        else {
            return Ok(Admission::Rejected(RejectReason::ConfirmationNotFound));
        };

        if let Some(reason) = self.rejection_for(&confirmation).await? {
            self.health
                .observe(self.confirmations.delete(&confirmation.id).await)?;
            info!(owner_id = confirmation.owner_id, "Confirmation rejected: {}", reason);
            return Ok(Admission::Rejected(reason));
        }

        self.health
            .observe(self.confirmations.delete(&confirmation.id).await)?;
        let entry = QueueEntryDbModel::new(
            confirmation.owner_id,
            confirmation.chat_ref,
            confirmation.message_ref,
            confirmation.source_ref,
            confirmation.display_name,
        );
        self.queue.enqueue(entry.clone()).await?;

        info!(
            owner_id = entry.owner_id,
            entry_id = %entry.id,
            "Queued {} (position {})",
            entry.display_name,
            self.queue.depth()
        );
        Ok(Admission::Accepted(entry))
    }

    async fn rejection_for(&self, confirmation: &ConfirmationDbModel) -> Result<Option<RejectReason>> {
        if is_expired(confirmation.created_at, self.ttl_ms(), now_ms()) {
            return Ok(Some(RejectReason::ConfirmationExpired));
        }

        let entitlement = self.entitlement(confirmation.owner_id).await?;
        if !entitlement.is_entitled() {
            return Ok(Some(RejectReason::NoEntitlement));
        }

        let queued = self.queue.count_for_owner(confirmation.owner_id).await?;
        let limit = entitlement.queue_limit();
        if queued >= limit {
            return Ok(Some(RejectReason::QueueLimitReached { queued, limit }));
        }
        Ok(None)
    }

    /// Drop a confirmation without queueing it.
    pub async fn reject(&self, confirmation_id: &str) -> Result<()> {
        self.health
            .observe(self.confirmations.delete(confirmation_id).await)?;
        Ok(())
    }
}
