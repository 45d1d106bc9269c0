//! In-memory registry of running jobs.
//!
//! Holds, under one lock, the cancellation registrations, the latest progress
//! snapshot per job, the jobs with a pending cancel request and the jobs that
//! already reached a terminal outcome but are still being cleaned up. Nothing
//! here is durable; a restart starts from an empty registry.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use super::progress::{ProgressKey, ProgressSnapshot, Stage};
use super::transcode::ProcessHandle;

/// Where the request that started a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginRef {
    pub chat_ref: i64,
    pub message_ref: i64,
}

/// A job that can be cancelled right now.
#[derive(Debug, Clone)]
pub struct CancellationRegistration {
    pub job_id: String,
    pub owner_id: i64,
    pub stage: Stage,
    /// Present only while transcoding.
    pub handle: Option<ProcessHandle>,
    pub origin: OriginRef,
    pub progress: ProgressKey,
}

impl CancellationRegistration {
    pub fn new(job_id: impl Into<String>, owner_id: i64, stage: Stage, origin: OriginRef) -> Self {
        let job_id = job_id.into();
        Self {
            progress: ProgressKey::new(job_id.clone(), stage),
            job_id,
            owner_id,
            stage,
            handle: None,
            origin,
        }
    }

    pub fn with_handle(mut self, handle: ProcessHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// A termination signal was sent to the transcoder.
    Signalled,
    /// The registration was withdrawn; the job stops at its next checkpoint.
    Withdrawn,
    /// The job is between stages; it stops when it tries to register again.
    Flagged,
    /// The job already reached a terminal outcome; nothing was recorded.
    Finished,
}

#[derive(Debug, Default)]
struct RegistryState {
    registrations: HashMap<String, CancellationRegistration>,
    progress: HashMap<String, ProgressSnapshot>,
    cancel_requested: HashSet<String>,
    finished: HashSet<String>,
}

/// Registrations, progress and pending cancellations of running jobs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register for a new stage) a job.
    ///
    /// Returns `false` without registering if a cancel request is pending for
    /// the job; the caller must treat the job as cancelled.
    pub fn register(&self, registration: CancellationRegistration) -> bool {
        let mut state = self.state.lock();
        if state.cancel_requested.contains(&registration.job_id) {
            return false;
        }
        debug!(
            job_id = %registration.job_id,
            stage = %registration.stage,
            "Registered for cancellation"
        );
        state
            .registrations
            .insert(registration.job_id.clone(), registration);
        true
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.state.lock().registrations.contains_key(job_id)
    }

    pub fn registration(&self, job_id: &str) -> Option<CancellationRegistration> {
        self.state.lock().registrations.get(job_id).cloned()
    }

    /// Record a cancel request.
    ///
    /// A transcoding job gets its process signalled immediately. A job in a
    /// transfer stage loses its registration, which its post-transfer check
    /// observes.
    pub fn request_cancel(&self, job_id: &str) -> CancelAction {
        let mut state = self.state.lock();
        if state.finished.contains(job_id) {
            return CancelAction::Finished;
        }
        state.cancel_requested.insert(job_id.to_string());

        let stage = state.registrations.get(job_id).map(|r| r.stage);
        match stage {
            Some(Stage::Transcode) => {
                if let Some(handle) = state
                    .registrations
                    .get(job_id)
                    .and_then(|r| r.handle.as_ref())
                {
                    handle.terminate();
                }
                CancelAction::Signalled
            }
            Some(Stage::TransferIn | Stage::TransferOut) => {
                state.registrations.remove(job_id);
                CancelAction::Withdrawn
            }
            None => CancelAction::Flagged,
        }
    }

    pub fn cancel_requested(&self, job_id: &str) -> bool {
        self.state.lock().cancel_requested.contains(job_id)
    }

    /// Whether a transfer stage must stop: either cancel was requested or the
    /// registration disappeared.
    pub fn transfer_cancelled(&self, job_id: &str) -> bool {
        let state = self.state.lock();
        state.cancel_requested.contains(job_id) || !state.registrations.contains_key(job_id)
    }

    /// Mark the job terminal and drop its registration.
    ///
    /// Returns whether the job was cancelled first, i.e. a cancel request is
    /// pending or its registration was withdrawn. Later cancel requests get
    /// [`CancelAction::Finished`] until [`release`](Self::release).
    pub fn finish(&self, job_id: &str) -> bool {
        let mut state = self.state.lock();
        let cancelled = state.cancel_requested.contains(job_id)
            || !state.registrations.contains_key(job_id);
        state.registrations.remove(job_id);
        state.finished.insert(job_id.to_string());
        cancelled
    }

    pub fn is_finished(&self, job_id: &str) -> bool {
        self.state.lock().finished.contains(job_id)
    }

    /// Overwrite the job's snapshot.
    pub fn update_progress(&self, snapshot: ProgressSnapshot) {
        self.state
            .lock()
            .progress
            .insert(snapshot.job_id.clone(), snapshot);
    }

    /// Overwrite the job's snapshot only while it is registered. Returns
    /// whether the snapshot was written.
    pub fn update_progress_if_registered(&self, snapshot: ProgressSnapshot) -> bool {
        let mut state = self.state.lock();
        if !state.registrations.contains_key(&snapshot.job_id) {
            return false;
        }
        state.progress.insert(snapshot.job_id.clone(), snapshot);
        true
    }

    /// Drop a pending cancel request for a job that is no longer running.
    pub fn forget_cancel(&self, job_id: &str) {
        self.state.lock().cancel_requested.remove(job_id);
    }

    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.state.lock().progress.get(job_id).cloned()
    }

    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.state.lock().progress.values().cloned().collect()
    }

    /// Drop transcode registrations whose process already exited.
    /// Returns the affected job ids.
    pub fn reap_exited(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let exited: Vec<String> = state
            .registrations
            .values()
            .filter(|r| r.stage == Stage::Transcode)
            .filter(|r| r.handle.as_ref().is_some_and(ProcessHandle::has_exited))
            .map(|r| r.job_id.clone())
            .collect();

        for job_id in &exited {
            state.registrations.remove(job_id);
        }
        exited
    }

    /// Forget everything about a job. Safe to call repeatedly.
    pub fn release(&self, job_id: &str) {
        let mut state = self.state.lock();
        state.registrations.remove(job_id);
        state.progress.remove(job_id);
        state.cancel_requested.remove(job_id);
        state.finished.remove(job_id);
    }

    /// Whether the registry holds any trace of `job_id`.
    pub fn contains(&self, job_id: &str) -> bool {
        let state = self.state.lock();
        state.registrations.contains_key(job_id)
            || state.progress.contains_key(job_id)
            || state.cancel_requested.contains(job_id)
            || state.finished.contains(job_id)
    }

    /// Clear all state. Running processes are asked to terminate.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for registration in state.registrations.values() {
            if let Some(handle) = &registration.handle {
                handle.terminate();
            }
        }
        *state = RegistryState::default();
    }

    pub fn len(&self) -> usize {
        self.state.lock().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
