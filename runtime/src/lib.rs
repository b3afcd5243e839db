//! Execute transfer tasks and persist blobs with a configurable runtime.
//!
//! This crate provides the environment that every other courier primitive is generic
//! over. Components never talk to Tokio or the filesystem directly; they accept a
//! context implementing some combination of [Spawner], [Clock], [Metrics], and
//! [Storage]. For production use, the [tokio] module provides a runtime backed by
//! [Tokio](https://tokio.rs) with blobs stored in a directory. The [memory] storage
//! keeps blobs in process memory and is convenient for tests.
//!
//! The crate also hosts the [pool::MemoryPool], the fixed-size buffer arena shared by
//! all in-flight transfers.
//!
//! # Terminology
//!
//! Each runtime is composed of a `Runner` and a `Context`. The `Runner` implements the
//! [Runner] trait and drives execution of a root task. The `Context` implements the
//! other traits to provide core functionality.

use prometheus_client::registry::Metric;
use std::{
    future::Future,
    io::Error as IoError,
    time::Duration,
};
use thiserror::Error;

mod handle;
pub use handle::Handle;
pub mod pool;
mod storage;
pub use storage::memory;
pub mod tokio;

/// Errors returned by a runtime or its storage.
#[derive(Error, Debug)]
pub enum Error {
    #[error("task exited before completing")]
    Exited,
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("invalid partition name (expected [A-Za-z0-9_-]+): {0}")]
    PartitionNameInvalid(String),
    #[error("failed to create partition: {0}")]
    PartitionCreationFailed(String),
    #[error("partition not found: {0}")]
    PartitionMissing(String),
    #[error("failed to open blob {0}/{1}: {2}")]
    BlobOpenFailed(String, String, IoError),
    #[error("blob not found: {0}/{1}")]
    BlobMissing(String, String),
    #[error("failed to resize blob {0}/{1}: {2}")]
    BlobResizeFailed(String, String, IoError),
    #[error("failed to sync blob {0}/{1}: {2}")]
    BlobSyncFailed(String, String, IoError),
    #[error("blob shorter than requested range")]
    BlobInsufficientLength,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("io error: {0}")]
    Io(#[from] IoError),
}

/// Drives a root task to completion.
pub trait Runner {
    /// Environment handed to the root task.
    type Context;

    /// Run `f` until it resolves and return its output.
    ///
    /// Tasks still running when the root task resolves are dropped.
    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future;
}

/// Starts background tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Run `f` on its own task, handing it this context.
    ///
    /// The task runs whether or not the returned [Handle] is awaited; dropping the
    /// handle detaches it. A task that panics resolves its handle with [Error::Exited].
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

/// Registers metrics under a hierarchical label.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Derive a context whose label is this one extended by `label`.
    ///
    /// # Panics
    ///
    /// If `label` is empty or contains anything but ASCII alphanumerics and underscores.
    fn with_label(&self, label: &str) -> Self;

    /// Register `metric` as `<label>_<name>`.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Every registered metric, in the Prometheus text exposition format.
    fn encode(&self) -> String;
}

/// Reads time and waits.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Resolves after `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;
}

/// Named blobs grouped into partitions.
///
/// Partition names are non-empty and only use ASCII alphanumerics, `-` and `_`. Blob
/// names are arbitrary bytes.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Blob handle returned by [Storage::open].
    type Blob: Blob;

    /// Open `name` in `partition`, creating both if needed, and return it with its length.
    ///
    /// Callers must not open the same blob for writing more than once at a time.
    fn open(
        &self,
        partition: &str,
        name: &[u8],
    ) -> impl Future<Output = Result<(Self::Blob, u64), Error>> + Send;
}

/// Positional reads and writes on one blob.
///
/// Clones share the same underlying file. Writes are only durable after [Blob::sync].
#[allow(clippy::len_without_is_empty)]
pub trait Blob: Clone + Send + Sync + 'static {
    /// Fill `buf` from `offset`, failing if the blob ends first.
    fn read_at(
        &self,
        buf: Vec<u8>,
        offset: u64,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `buf` at `offset`, growing the blob if it ends first.
    fn write_at(
        &self,
        buf: Vec<u8>,
        offset: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Length in bytes.
    fn len(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Truncate, or zero-extend, to `len` bytes.
    fn resize(&self, len: u64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Flush all writes to durable storage.
    fn sync(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_macros::test_traced;
    use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
    use std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Instant,
    };

    #[test_traced]
    fn test_root_output() {
        let result: Result<u64, String> =
            tokio::Runner::default().start(|_| async { Err("journal missing".to_string()) });
        assert_eq!(result, Err("journal missing".to_string()));
    }

    #[test_traced]
    fn test_sleep_elapses() {
        tokio::Runner::default().start(|context| async move {
            let before = Instant::now();
            context.sleep(Duration::from_millis(20)).await;
            assert!(before.elapsed() >= Duration::from_millis(20));
        });
    }

    #[test_traced]
    fn test_spawned_tasks_complete() {
        tokio::Runner::default().start(|context| async move {
            let bytes = Arc::new(AtomicU64::new(0));
            let handles: Vec<_> = (1..=16u64)
                .map(|len| {
                    let bytes = bytes.clone();
                    context.clone().spawn(move |_| async move {
                        bytes.fetch_add(len, Ordering::Relaxed);
                        len
                    })
                })
                .collect();
            let mut total = 0;
            for handle in handles {
                total += handle.await.unwrap();
            }
            assert_eq!(total, 136);
            assert_eq!(bytes.load(Ordering::Relaxed), 136);
        });
    }

    #[test_traced]
    fn test_panicking_task_exits() {
        tokio::Runner::default().start(|context| async move {
            let handle = context.spawn(|_| async move {
                panic!("lost connection");
            });
            let result: Result<(), Error> = handle.await;
            assert!(matches!(result, Err(Error::Exited)));
        });
    }

    #[test_traced]
    fn test_aborted_task_exits() {
        tokio::Runner::default().start(|context| async move {
            let handle = context.clone().spawn(|context| async move {
                context.sleep(Duration::from_secs(60)).await;
            });
            handle.abort();
            assert!(matches!(handle.await, Err(Error::Exited)));
        });
    }

    #[test_traced]
    fn test_labels_prefix_metrics() {
        tokio::Runner::default().start(|context| async move {
            let scheduler = context.with_label("scheduler");
            let dispatched = Counter::<u64>::default();
            scheduler.register("dispatched", "Units dispatched", dispatched.clone());
            dispatched.inc_by(3);

            let memory = scheduler.with_label("memory");
            let cells = Gauge::<i64>::default();
            memory.register("cells", "Cells in use", cells.clone());
            cells.set(7);

            let encoded = context.encode();
            assert!(encoded.contains("scheduler_dispatched_total 3"));
            assert!(encoded.contains("scheduler_memory_cells 7"));
        });
    }

    #[test]
    #[should_panic(expected = "label must be non-empty")]
    fn test_invalid_label() {
        tokio::Runner::default().start(|context| async move {
            context.with_label("bad label");
        });
    }
}
