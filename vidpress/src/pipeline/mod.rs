//! Compression job pipeline.
//!
//! - [`job_queue`]: durable FIFO with an in-memory mirror
//! - [`worker_pool`]: fixed-size pool pulling from the queue
//! - [`job`]: the per-job state machine
//! - [`registry`]: cancellation registrations and progress snapshots
//! - [`reconciler`]: sweep releasing registrations of exited processes
//! - [`transcode`] and [`transfer`]: external collaborators

pub mod job;
pub mod job_queue;
pub mod notifier;
pub mod progress;
pub mod reconciler;
pub mod registry;
pub mod status;
pub mod transcode;
pub mod transfer;
pub mod worker_pool;

pub use job::{JobContext, JobOutcome, JobPipeline, JobState};
pub use job_queue::JobQueue;
pub use notifier::{CompletedJob, JobNotifier, TracingNotifier};
pub use progress::{ProgressKey, ProgressSink, ProgressSnapshot, Stage, render_gauge};
pub use reconciler::Reconciler;
pub use registry::{CancelAction, CancellationRegistration, JobRegistry, OriginRef};
pub use status::{ActiveJobStatus, OwnerQueueCount, QueueStatus};
pub use transcode::{FfmpegTranscoder, ProcessHandle};
pub use transfer::{LocalTransfer, TransferClient, UploadMetadata};
pub use worker_pool::WorkerPool;
