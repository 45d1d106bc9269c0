//! Active job model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::QueueEntryDbModel;
use crate::database::time::now_ms;

/// One running pipeline. The job id is generated per run and never reused.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ActiveJobDbModel {
    pub job_id: String,
    pub queue_entry_id: String,
    pub owner_id: i64,
    pub source_ref: String,
    pub display_name: String,
    pub started_at: i64,
}

impl ActiveJobDbModel {
    /// Start a new run for a queue entry with a fresh job id.
    pub fn start(entry: &QueueEntryDbModel) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            queue_entry_id: entry.id.clone(),
            owner_id: entry.owner_id,
            source_ref: entry.source_ref.clone(),
            display_name: entry.display_name.clone(),
            started_at: now_ms(),
        }
    }
}
