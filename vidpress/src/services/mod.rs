//! Application services.

pub mod container;

pub use container::{CancelOutcome, ServiceContainer};
