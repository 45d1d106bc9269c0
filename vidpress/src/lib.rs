//! vidpress: queued video compression with durable jobs, live progress and
//! cancellation.
//!
//! Submissions pass an admission handshake, wait in a durable FIFO queue and
//! are processed by a fixed-size worker pool. Each job downloads its source,
//! runs ffmpeg and uploads the result, and can be cancelled at any stage.

pub mod admission;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
