//! Active job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ActiveJobDbModel;
use crate::database::retry::retry_on_sqlite_busy;

#[async_trait]
pub trait ActiveJobRepository: Send + Sync {
    async fn insert(&self, job: &ActiveJobDbModel) -> Result<()>;
    async fn get(&self, job_id: &str) -> Result<Option<ActiveJobDbModel>>;
    async fn list_all(&self) -> Result<Vec<ActiveJobDbModel>>;
    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<ActiveJobDbModel>>;
    async fn delete(&self, job_id: &str) -> Result<bool>;
    /// Drop every row. Used at startup, where no pipeline can be running yet.
    async fn delete_all(&self) -> Result<u64>;
}

/// SQLx implementation of [`ActiveJobRepository`].
pub struct SqlxActiveJobRepository {
    pool: SqlitePool,
}

impl SqlxActiveJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActiveJobRepository for SqlxActiveJobRepository {
    async fn insert(&self, job: &ActiveJobDbModel) -> Result<()> {
        retry_on_sqlite_busy("active_job_insert", || async {
            sqlx::query(
                r#"
                INSERT INTO active_jobs
                    (job_id, queue_entry_id, owner_id, source_ref, display_name, started_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.job_id)
            .bind(&job.queue_entry_id)
            .bind(job.owner_id)
            .bind(&job.source_ref)
            .bind(&job.display_name)
            .bind(job.started_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, job_id: &str) -> Result<Option<ActiveJobDbModel>> {
        let job = sqlx::query_as::<_, ActiveJobDbModel>("SELECT * FROM active_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_all(&self) -> Result<Vec<ActiveJobDbModel>> {
        let jobs =
            sqlx::query_as::<_, ActiveJobDbModel>("SELECT * FROM active_jobs ORDER BY started_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(jobs)
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<ActiveJobDbModel>> {
        let jobs = sqlx::query_as::<_, ActiveJobDbModel>(
            "SELECT * FROM active_jobs WHERE owner_id = ? ORDER BY started_at",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        retry_on_sqlite_busy("active_job_delete", || async {
            let result = sqlx::query("DELETE FROM active_jobs WHERE job_id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM active_jobs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
