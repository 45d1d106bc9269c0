//! Periodic sweep releasing registrations of processes that already exited.
//!
//! A pipeline normally observes its own transcoder's exit. The sweep only
//! catches handles nobody is awaiting any more, so registrations cannot leak.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::registry::JobRegistry;

pub struct Reconciler {
    registry: Arc<JobRegistry>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl Reconciler {
    pub fn new(registry: Arc<JobRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// One sweep. Returns the number of released registrations.
    pub fn sweep(&self) -> usize {
        let reaped = self.registry.reap_exited();
        for job_id in &reaped {
            debug!(job_id = %job_id, "Released registration of exited transcoder");
        }
        reaped.len()
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancellation_token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.sweep();
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}
