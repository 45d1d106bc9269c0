//! Repository layer for database access.

pub mod active_job;
pub mod confirmation;
pub mod owner;
pub mod queue;

pub use active_job::{ActiveJobRepository, SqlxActiveJobRepository};
pub use confirmation::{ConfirmationRepository, SqlxConfirmationRepository};
pub use owner::{OwnerRepository, SqlxOwnerRepository};
pub use queue::{QueueRepository, SqlxQueueRepository};
