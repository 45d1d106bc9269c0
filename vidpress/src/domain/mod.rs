//! Domain types shared by admission and the pipeline.

pub mod plan;
pub mod settings;

pub use plan::{Entitlement, Plan};
pub use settings::VideoSettings;
