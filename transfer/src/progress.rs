//! Track transfer progress across a tree of jobs.
//!
//! A directory job owns a [ProgressTracker] and each of its files gets a child tracker.
//! Every increment on a child is applied to each of its ancestors, so the root always
//! reflects the whole job. Children only hold weak links to their parents: dropping the
//! root does not keep it alive through its children.

use bytes::{Buf, BufMut};
use courier_codec::{EncodeSize, Error, Read, Write};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

/// A snapshot of a [ProgressTracker], as persisted in a checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
}

impl Write for Progress {
    fn write(&self, buf: &mut impl BufMut) {
        self.bytes_transferred.write(buf);
        self.files_transferred.write(buf);
        self.files_skipped.write(buf);
        self.files_failed.write(buf);
    }
}

impl EncodeSize for Progress {
    fn encode_size(&self) -> usize {
        4 * u64::BITS as usize / 8
    }
}

impl Read for Progress {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(Self {
            bytes_transferred: u64::read(buf)?,
            files_transferred: u64::read(buf)?,
            files_skipped: u64::read(buf)?,
            files_failed: u64::read(buf)?,
        })
    }
}

/// Thread-safe progress counters that propagate to a parent tracker.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    bytes_transferred: AtomicU64,
    files_transferred: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,

    parent: Option<Weak<ProgressTracker>>,
}

impl ProgressTracker {
    /// Create a root tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a root tracker starting from a persisted snapshot.
    pub fn restore(progress: Progress) -> Arc<Self> {
        Arc::new(Self::from_progress(progress, None))
    }

    /// Create a child tracker.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        self.restore_child(Progress::default())
    }

    /// Create a child tracker starting from a persisted snapshot.
    ///
    /// The snapshot is not applied to this tracker: a restored parent already includes
    /// the progress of its children.
    pub fn restore_child(self: &Arc<Self>, progress: Progress) -> Arc<Self> {
        Arc::new(Self::from_progress(progress, Some(Arc::downgrade(self))))
    }

    fn from_progress(progress: Progress, parent: Option<Weak<ProgressTracker>>) -> Self {
        Self {
            bytes_transferred: AtomicU64::new(progress.bytes_transferred),
            files_transferred: AtomicU64::new(progress.files_transferred),
            files_skipped: AtomicU64::new(progress.files_skipped),
            files_failed: AtomicU64::new(progress.files_failed),
            parent,
        }
    }

    /// Apply `f` to this tracker and each live ancestor.
    fn propagate(&self, f: impl Fn(&ProgressTracker)) {
        f(self);
        let mut parent = self.parent.as_ref().and_then(Weak::upgrade);
        while let Some(tracker) = parent {
            f(&tracker);
            parent = tracker.parent.as_ref().and_then(Weak::upgrade);
        }
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.propagate(|tracker| {
            tracker.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        });
    }

    pub fn add_file_transferred(&self) {
        self.propagate(|tracker| {
            tracker.files_transferred.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn add_file_skipped(&self) {
        self.propagate(|tracker| {
            tracker.files_skipped.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn add_file_failed(&self) {
        self.propagate(|tracker| {
            tracker.files_failed.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Current values of all counters.
    pub fn snapshot(&self) -> Progress {
        Progress {
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
        }
    }
}
