//! Confirmation request repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ConfirmationDbModel;

#[async_trait]
pub trait ConfirmationRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ConfirmationDbModel>>;
    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<ConfirmationDbModel>>;
    /// Atomically drop the owner's previous confirmations and insert `confirmation`.
    async fn replace_for_owner(&self, confirmation: &ConfirmationDbModel) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// SQLx implementation of [`ConfirmationRepository`].
pub struct SqlxConfirmationRepository {
    pool: SqlitePool,
}

impl SqlxConfirmationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfirmationRepository for SqlxConfirmationRepository {
    async fn get(&self, id: &str) -> Result<Option<ConfirmationDbModel>> {
        let confirmation =
            sqlx::query_as::<_, ConfirmationDbModel>("SELECT * FROM confirmations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(confirmation)
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<ConfirmationDbModel>> {
        let confirmations = sqlx::query_as::<_, ConfirmationDbModel>(
            "SELECT * FROM confirmations WHERE owner_id = ? ORDER BY created_at",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(confirmations)
    }

    async fn replace_for_owner(&self, confirmation: &ConfirmationDbModel) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM confirmations WHERE owner_id = ?")
            .bind(confirmation.owner_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO confirmations
                (id, owner_id, chat_ref, message_ref, source_ref, display_name, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&confirmation.id)
        .bind(confirmation.owner_id)
        .bind(confirmation.chat_ref)
        .bind(confirmation.message_ref)
        .bind(&confirmation.source_ref)
        .bind(&confirmation.display_name)
        .bind(confirmation.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM confirmations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
