//! A single-blob journal of resumable transfers.
//!
//! A [StreamJournal] stores one base transfer (the top-level job) and any number of
//! subtransfers, each paired with a progress record. Records are opaque to the journal:
//! any type implementing [courier_codec::Codec] can be stored.
//!
//! # Format
//!
//! All integers are big-endian.
//!
//! ```text
//! +---------------+---------------+-------------------------------+---------+---------+-----
//! | Version (256) |  Head (256)   | Base record (9 KiB) | Progress (1 KiB) | Chunk 0 | Chunk 1 | ...
//! +---------------+---------------+-------------------------------+---------+---------+-----
//!
//! Version = Len(u8) | UTF-8 format version | zero padding
//! Head    = used_head(u64) | used_tail(u64) | free_head(u64) | free_tail(u64) | zero padding
//! ```
//!
//! Each chunk is 10 KiB:
//!
//! ```text
//! +-----------+-----------+---------------------------------+---------------------------------+
//! | prev(u64) | next(u64) | Len(u32) | Record (9 KiB total) | Len(u32) | Progress (1 KiB)     |
//! +-----------+-----------+---------------------------------+---------------------------------+
//! ```
//!
//! Head and chunk pointers are blob offsets, with 0 as null. Chunks holding a subtransfer
//! form a doubly-linked "used" list in insertion order. Removed chunks form a singly-linked
//! "free" list (reusing `prev` as the next free chunk) and are recycled before the blob
//! grows. Free chunks are never coalesced and the blob never shrinks, except when the base
//! transfer is removed, which truncates the blob to zero.
//!
//! # Integrity
//!
//! The format version is checked on every open and a mismatch is fatal
//! ([Error::VersionMismatch]). Links are validated whenever they are followed: a chunk
//! whose neighbours do not point back at it, a list that does not end at the recorded
//! tail, or a pointer outside of the allocated chunks is reported as [Error::Corrupted].
//! Neither is ever repaired.
//!
//! # Durability
//!
//! Every mutation ends with a sync of the blob. Writes within a mutation are ordered so
//! that a chunk is fully written before it is linked, but a crash between writes may
//! still leave the lists inconsistent.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::{Runner, tokio};
//! use courier_storage::journal::{Config, StreamJournal};
//! use futures::StreamExt;
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let cfg = Config {
//!         partition: "checkpoints".into(),
//!         name: b"job".to_vec(),
//!         format_version: "courier/1".into(),
//!     };
//!     let (journal, base) =
//!         StreamJournal::<_, String, u64>::init(context, cfg).await.unwrap();
//!     assert!(base.is_none());
//!
//!     // Record a job and one of its files
//!     journal.add_transfer(&"job".to_string(), &0).await.unwrap();
//!     let file = journal.add_subtransfer(&"file".to_string(), &0).await.unwrap();
//!     journal.update_progress(file, &1024).await.unwrap();
//!
//!     // List outstanding files
//!     let files: Vec<_> = journal.list_sub_transfers().collect().await;
//!     assert_eq!(files.len(), 1);
//! });
//! ```

mod stream;

pub use stream::StreamJournal;
use thiserror::Error;

/// Errors that can occur when interacting with the journal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] courier_runtime::Error),
    #[error("codec error: {0}")]
    Codec(#[from] courier_codec::Error),
    #[error("format version mismatch: found {0}, expected {1}")]
    VersionMismatch(String, String),
    #[error("journal corrupted at offset {0}: {1}")]
    Corrupted(u64, &'static str),
    #[error("base transfer already exists")]
    BaseTransferExists,
    #[error("no base transfer")]
    NoBaseTransfer,
    #[error("record too large: {0} > {1}")]
    RecordTooLarge(usize, usize),
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),
}

/// Configuration for [StreamJournal] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// The [courier_runtime::Storage] partition holding the journal blob.
    pub partition: String,

    /// Name of the journal blob.
    pub name: Vec<u8>,

    /// Format version written at creation and required on every reopen.
    ///
    /// Must be at most 255 bytes.
    pub format_version: String,
}

/// Position of a record in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Handle {
    /// The base transfer.
    Base,
    /// A subtransfer stored in the chunk at the given offset.
    Chunk(u64),
}

/// A stored transfer and its progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<T, P> {
    pub handle: Handle,
    pub transfer: T,
    pub progress: P,
}
