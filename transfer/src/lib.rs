//! Schedule, pace, verify, and checkpoint bulk transfers with bounded memory.
//!
//! Callers hand opaque [scheduler::Controller]s (one per job) to a
//! [scheduler::TransferScheduler], which runs their work steps across a bounded number
//! of concurrent units. Controllers draw fixed-size buffers from the scheduler's
//! [memory::MemoryManager], size their range requests and apply backpressure through
//! the [pacer::Pacer], verify content with an [hash::Md5HashStream], and persist
//! enough state in a [checkpoint::Checkpoint] to resume an interrupted job.
//!
//! # Status
//!
//! `courier-transfer` is **ALPHA** software and is not yet recommended for production
//! use. Developers should expect breaking changes and occasional instability.

use thiserror::Error;

pub mod checkpoint;
pub mod config;
pub use config::{Budget, Config};
pub mod hash;
pub mod memory;
pub mod pacer;
pub mod progress;
pub mod records;
pub mod retry;
pub mod scheduler;

/// Errors that can occur when transferring.
#[derive(Debug, Error)]
pub enum Error {
    #[error("journal error: {0}")]
    Journal(#[from] courier_storage::journal::Error),
    #[error("runtime error: {0}")]
    Runtime(#[from] courier_runtime::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to allocate memory")]
    OutOfMemory,
    #[error("scheduler disposed")]
    Disposed,
    #[error("canceled")]
    Canceled,
    #[error("uncategorized transfer failure: {0}")]
    Uncategorized(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("all {} attempts failed", .0.len())]
    Aggregate(Vec<Error>),
}
