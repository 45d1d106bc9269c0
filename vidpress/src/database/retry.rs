//! Retry wrapper for writes that hit SQLite's busy/locked state.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 8;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1000;

fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    if let sqlx::Error::Database(db_err) = sqlx_err
        && matches!(db_err.code().as_deref(), Some("5") | Some("6"))
    {
        return true;
    }

    let msg = sqlx_err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports
/// the database as busy or locked. Any other error is returned immediately.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let backoff = BUSY_BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(BUSY_MAX_DELAY_MS);
                let jitter = random::<u64>() % (backoff / 4 + 1);
                let delay = Duration::from_millis((backoff + jitter).min(BUSY_MAX_DELAY_MS));

                attempt += 1;
                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name, delay, attempt, BUSY_MAX_RETRIES
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
