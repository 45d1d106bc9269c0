//! Store availability tracking.
//!
//! Any component that sees [`Error::StoreUnavailable`] reports it here. The
//! tracker flips to unavailable, starts a single probe task that pings the
//! store with backoff, and flips back once a query succeeds. Admission fails
//! fast and workers park on [`StoreHealth::wait_available`] in the meantime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use super::DbPool;
use crate::{Error, Result};

const PROBE_BASE_DELAY: Duration = Duration::from_millis(250);
const PROBE_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Inner {
    available: AtomicBool,
    probing: AtomicBool,
    notify: Notify,
}

/// Shared, cloneable store availability flag.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pool: DbPool,
    inner: Arc<Inner>,
}

impl StoreHealth {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            inner: Arc::new(Inner {
                available: AtomicBool::new(true),
                probing: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Fail fast with `StoreUnavailable` while the store is down.
    pub fn check(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(
                "store is unreachable, waiting for recovery".to_string(),
            ))
        }
    }

    /// Inspect a result and mark the store down if it failed to reach the store.
    pub fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.is_store_unavailable()
        {
            self.report(err);
        }
        result
    }

    /// Mark the store unavailable and start probing for recovery.
    pub fn report(&self, err: &Error) {
        if self.inner.available.swap(false, Ordering::AcqRel) {
            warn!("Durable store unavailable: {}", err);
        }
        if self.inner.probing.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.probe_until_available().await;
        });
    }

    /// Wait until the store is available. Returns immediately if it already is.
    pub async fn wait_available(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_available() {
                return;
            }
            notified.await;
        }
    }

    async fn probe_until_available(&self) {
        let mut delay = PROBE_BASE_DELAY;
        loop {
            tokio::time::sleep(delay).await;
            match sqlx::query("SELECT 1").execute(&self.pool).await {
                Ok(_) => break,
                Err(e) => {
                    warn!("Store probe failed, retrying in {:?}: {}", delay, e);
                    delay = (delay * 2).min(PROBE_MAX_DELAY);
                }
            }
        }

        self.inner.probing.store(false, Ordering::Release);
        self.inner.available.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        info!("Durable store reachable again");
    }
}
