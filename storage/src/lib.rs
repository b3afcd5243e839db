//! Persist resumable transfer checkpoints.
//!
//! The [journal] module provides the [journal::StreamJournal], a single-blob store that
//! keeps one base record plus any number of subrecords in fixed-size chunks, recycling
//! chunks of removed records before growing the blob.
//!
//! # Status
//!
//! `courier-storage` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod journal;
