//! Database record models.

pub mod active_job;
pub mod confirmation;
pub mod owner;
pub mod queue_entry;

pub use active_job::ActiveJobDbModel;
pub use confirmation::ConfirmationDbModel;
pub use owner::OwnerDbModel;
pub use queue_entry::QueueEntryDbModel;
