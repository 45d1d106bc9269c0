//! Confirmation request model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A pending "compress this video?" handshake.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ConfirmationDbModel {
    pub id: String,
    pub owner_id: i64,
    pub chat_ref: i64,
    pub message_ref: i64,
    pub source_ref: String,
    pub display_name: String,
    pub created_at: i64,
}

impl ConfirmationDbModel {
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
            created_at: now_ms(),
        }
    }
}
