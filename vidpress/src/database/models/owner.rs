//! Owner (client account) model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Plan, counters and stored video settings for one owner.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct OwnerDbModel {
    pub owner_id: i64,
    /// Plan name (`standard`, `pro`, `premium`, `ultra`); `None` means no plan.
    pub plan: Option<String>,
    /// Epoch milliseconds; `None` means the plan does not expire.
    pub expires_at: Option<i64>,
    pub completed_jobs: i64,
    /// JSON-encoded `VideoSettings`; `None` means defaults.
    pub video_settings: Option<String>,
}

impl OwnerDbModel {
    pub fn new(owner_id: i64) -> Self {
        Self {
            owner_id,
            plan: None,
            expires_at: None,
            completed_jobs: 0,
            video_settings: None,
        }
    }
}
