//! Queue entry model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A confirmed compression request waiting for (or occupying) a worker.
///
/// `(owner_id, chat_ref, message_ref)` identifies the originating message and
/// is unique across the queue.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct QueueEntryDbModel {
    pub id: String,
    pub owner_id: i64,
    pub chat_ref: i64,
    pub message_ref: i64,
    pub source_ref: String,
    pub display_name: String,
    /// Epoch milliseconds; FIFO ordering key.
    pub submitted_at: i64,
}

impl QueueEntryDbModel {
    pub fn new(
        owner_id: i64,
        chat_ref: i64,
        message_ref: i64,
        source_ref: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            chat_ref,
            message_ref,
            source_ref: source_ref.into(),
            display_name: display_name.into(),
            submitted_at: now_ms(),
        }
    }
}
