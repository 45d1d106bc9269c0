//! Queue entry repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::QueueEntryDbModel;
use crate::database::retry::retry_on_sqlite_busy;

/// Durable FIFO storage for confirmed requests.
///
/// Listings are ordered by `submitted_at`, ties broken by insertion order.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn insert(&self, entry: &QueueEntryDbModel) -> Result<()>;
    async fn exists(&self, id: &str) -> Result<bool>;
    async fn list_all(&self) -> Result<Vec<QueueEntryDbModel>>;
    async fn count_for_owner(&self, owner_id: i64) -> Result<i64>;
    /// `(owner_id, count)` pairs, ordered by owner id.
    async fn counts_by_owner(&self) -> Result<Vec<(i64, i64)>>;
    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// SQLx implementation of [`QueueRepository`].
pub struct SqlxQueueRepository {
    pool: SqlitePool,
}

impl SqlxQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, owner_id, chat_ref, message_ref, source_ref, display_name, submitted_at FROM queue_entries";

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn insert(&self, entry: &QueueEntryDbModel) -> Result<()> {
        retry_on_sqlite_busy("queue_insert", || async {
            sqlx::query(
                r#"
                INSERT INTO queue_entries
                    (id, owner_id, chat_ref, message_ref, source_ref, display_name, submitted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(entry.owner_id)
            .bind(entry.chat_ref)
            .bind(entry.message_ref)
            .bind(&entry.source_ref)
            .bind(&entry.display_name)
            .bind(entry.submitted_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM queue_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn list_all(&self) -> Result<Vec<QueueEntryDbModel>> {
        let entries = sqlx::query_as::<_, QueueEntryDbModel>(&format!(
            "{SELECT_COLUMNS} ORDER BY submitted_at, seq"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn count_for_owner(&self, owner_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn counts_by_owner(&self) -> Result<Vec<(i64, i64)>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT owner_id, COUNT(*) FROM queue_entries GROUP BY owner_id ORDER BY owner_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("queue_delete", || async {
            let result = sqlx::query("DELETE FROM queue_entries WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
