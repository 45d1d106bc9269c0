//! Owner repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::OwnerDbModel;

#[async_trait]
pub trait OwnerRepository: Send + Sync {
    async fn get(&self, owner_id: i64) -> Result<Option<OwnerDbModel>>;
    async fn set_plan(&self, owner_id: i64, plan: Option<&str>, expires_at: Option<i64>)
    -> Result<()>;
    async fn increment_completed(&self, owner_id: i64) -> Result<()>;
    async fn set_video_settings(&self, owner_id: i64, settings: Option<&str>) -> Result<()>;
}

/// SQLx implementation of [`OwnerRepository`].
pub struct SqlxOwnerRepository {
    pool: SqlitePool,
}

impl SqlxOwnerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnerRepository for SqlxOwnerRepository {
    async fn get(&self, owner_id: i64) -> Result<Option<OwnerDbModel>> {
        let owner = sqlx::query_as::<_, OwnerDbModel>("SELECT * FROM owners WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }

    async fn set_plan(
        &self,
        owner_id: i64,
        plan: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owners (owner_id, plan, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(owner_id) DO UPDATE SET plan = excluded.plan, expires_at = excluded.expires_at
            "#,
        )
        .bind(owner_id)
        .bind(plan)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_completed(&self, owner_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owners (owner_id, completed_jobs) VALUES (?, 1)
            ON CONFLICT(owner_id) DO UPDATE SET completed_jobs = completed_jobs + 1
            "#,
        )
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_video_settings(&self, owner_id: i64, settings: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owners (owner_id, video_settings) VALUES (?, ?)
            ON CONFLICT(owner_id) DO UPDATE SET video_settings = excluded.video_settings
            "#,
        )
        .bind(owner_id)
        .bind(settings)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
