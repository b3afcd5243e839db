//! Incrementally hash the data flowing through a shared stream, even across resumption.
//!
//! An [Md5HashStream] wraps a [Stream] that controllers read from (uploads) or write to
//! (downloads) at arbitrary offsets, and computes the MD5 of its content in order.
//!
//! # Resumption
//!
//! When a transfer resumes at offset `R > 0`, the bytes in `[0, R)` were handled by a
//! previous run and never passed through this hasher. [Md5HashStream::calculate_md5]
//! performs a one-time _catch-up_ pass that reads them back from the stream. While it
//! runs:
//!
//! - blocks reported at exactly the end of the catch-up range extend the range (they
//!   are [Transform::Deferred] to the catch-up pass, which reads them back), and
//! - all stream I/O goes through a single-slot gate, so catch-up reads never
//!   interleave with controller I/O.
//!
//! Once catch-up completes, the gate is bypassed and blocks at or past the end of the
//! hashed range are hashed directly. If catch-up fails, the hash can never be
//! completed: every later operation reports failure.
//!
//! Without verification, or when resuming from offset 0, there is nothing to catch up
//! on and the stream starts out finished.

use crate::{memory::MemoryManager, Error};
use async_lock::Semaphore;
use courier_runtime::{pool::Buffer, Blob, Clock};
use md5::{Digest, Md5};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Delay between checks for catch-up completion when finalizing.
const FINAL_BLOCK_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Number of checks for catch-up completion before giving up on the digest.
const FINAL_BLOCK_WAIT_ATTEMPTS: usize = 3_000;

/// A stream of bytes addressed by offset.
pub trait Stream: Send + Sync + 'static {
    /// Whether the stream supports reading at arbitrary offsets.
    fn can_seek(&self) -> bool;

    /// Read up to `buf.len()` bytes at `offset`, returning the number read (0 at the end
    /// of the stream).
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A [Stream] over a runtime [Blob].
#[derive(Clone)]
pub struct BlobStream<B: Blob> {
    blob: B,
}

impl<B: Blob> BlobStream<B> {
    pub fn new(blob: B) -> Self {
        Self { blob }
    }
}

impl<B: Blob> Stream for BlobStream<B> {
    fn can_seek(&self) -> bool {
        true
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let len = self.blob.len().await?;
        if offset >= len {
            return Ok(0);
        }
        let read = buf.len().min((len - offset) as usize);
        let data = self.blob.read_at(vec![0u8; read], offset).await?;
        buf[..read].copy_from_slice(&data);
        Ok(read)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.blob
            .write_at(buf.to_vec(), offset)
            .await
            .map_err(Error::Runtime)
    }
}

/// Outcome of [Md5HashStream::transform_block].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transform {
    /// The block was added to the hash.
    Hashed,
    /// The block extends the catch-up range and will be hashed by the catch-up pass.
    Deferred,
    /// The block does not affect the hash (already hashed, verification disabled, or
    /// not contiguous with the catch-up range).
    Skipped,
    /// The hash can no longer be completed.
    Failed,
}

struct HashState {
    md5: Md5,

    // End of the range hashed so far (or, during catch-up, to be hashed by the pass)
    offset: u64,
    succeeded: bool,
}

/// A [Stream] wrapper that computes the MD5 of its content.
pub struct Md5HashStream<S: Stream> {
    stream: S,
    check: bool,

    gate: Semaphore,
    finished: AtomicBool,
    state: Mutex<HashState>,
}

impl<S: Stream> Md5HashStream<S> {
    /// Wrap `stream`, which has already been transferred up to `resume_offset`.
    ///
    /// If `check` is false, no hash is computed.
    pub fn new(stream: S, check: bool, resume_offset: u64) -> Self {
        let catch_up = check && resume_offset > 0;
        Self {
            stream,
            check,
            gate: Semaphore::new(1),
            finished: AtomicBool::new(!catch_up),
            state: Mutex::new(HashState {
                md5: Md5::new(),
                offset: resume_offset,
                succeeded: true,
            }),
        }
    }

    /// The wrapped stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Whether catch-up is done (or was never needed).
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether the hash can still be completed.
    pub fn succeeded(&self) -> bool {
        self.state.lock().unwrap().succeeded
    }

    /// Run `io` under the gate while catch-up is unfinished.
    async fn gated<T>(&self, io: impl Future<Output = T>) -> T {
        if self.finished() {
            return io.await;
        }
        let _guard = self.gate.acquire().await;
        io.await
    }

    /// Read up to `buf.len()` bytes at `offset`.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        self.gated(self.stream.read_at(buf, offset)).await
    }

    /// Write all of `buf` at `offset`.
    pub async fn write(&self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.gated(self.stream.write_at(buf, offset)).await
    }

    /// Read up to `len` bytes at `offset` into consecutive buffers.
    ///
    /// Returns the number of bytes read, which is less than `len` only at the end of the
    /// stream.
    pub async fn read_chunks(
        &self,
        offset: u64,
        buffers: &mut [Buffer],
        len: usize,
    ) -> Result<usize, Error> {
        self.gated(async {
            let mut read = 0;
            for buffer in buffers.iter_mut() {
                let want = buffer.len().min(len - read);
                let mut filled = 0;
                while filled < want {
                    let n = self
                        .stream
                        .read_at(&mut buffer[filled..want], offset + (read + filled) as u64)
                        .await?;
                    if n == 0 {
                        return Ok(read + filled);
                    }
                    filled += n;
                }
                read += filled;
                if read == len {
                    break;
                }
            }
            Ok(read)
        })
        .await
    }

    /// Write the first `len` bytes held by consecutive buffers at `offset`.
    pub async fn write_chunks(
        &self,
        offset: u64,
        buffers: &[Buffer],
        len: usize,
    ) -> Result<(), Error> {
        self.gated(async {
            let mut written = 0;
            for buffer in buffers {
                if written == len {
                    break;
                }
                let n = buffer.len().min(len - written);
                self.stream
                    .write_at(&buffer[..n], offset + written as u64)
                    .await?;
                written += n;
            }
            if written < len {
                return Err(Error::Stream(format!(
                    "buffers hold {written} of {len} bytes"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Hash the already-transferred range, finishing catch-up.
    ///
    /// Does nothing if catch-up is not needed. On any failure, the hash is marked as
    /// permanently failed before the error is returned.
    pub async fn calculate_md5<E: Clock>(
        &self,
        memory: &MemoryManager<E>,
        canceled: impl Fn() -> bool,
    ) -> Result<(), Error> {
        if self.finished() {
            return Ok(());
        }
        let result = self.catch_up(memory, canceled).await;
        if let Err(err) = &result {
            warn!(?err, "md5 catch-up failed");
            self.state.lock().unwrap().succeeded = false;
            self.finished.store(true, Ordering::Release);
        }
        result
    }

    async fn catch_up<E: Clock>(
        &self,
        memory: &MemoryManager<E>,
        canceled: impl Fn() -> bool,
    ) -> Result<(), Error> {
        if !self.stream.can_seek() {
            return Err(Error::Stream("cannot re-read an unseekable stream".into()));
        }
        let mut buffer = memory.require_buffer_with_retry(&canceled).await?;
        let mut position = 0u64;
        loop {
            if canceled() {
                return Err(Error::Canceled);
            }

            // The range may grow while we read
            let target = self.state.lock().unwrap().offset;
            let want = buffer.len().min((target - position) as usize);
            let read = if want == 0 {
                0
            } else {
                let n = self
                    .gated(self.stream.read_at(&mut buffer[..want], position))
                    .await?;
                if n == 0 {
                    return Err(Error::Stream(format!(
                        "stream ended at {position} before {target}"
                    )));
                }
                n
            };

            let mut state = self.state.lock().unwrap();
            state.md5.update(&buffer[..read]);
            position += read as u64;
            if position == state.offset {
                self.finished.store(true, Ordering::Release);
                debug!(offset = position, "md5 catch-up finished");
                return Ok(());
            }
        }
    }

    /// Account for a block at `offset` that passed through the stream.
    pub fn transform_block(&self, offset: u64, block: &[u8]) -> Transform {
        if !self.check {
            return Transform::Skipped;
        }
        let mut state = self.state.lock().unwrap();
        if !state.succeeded {
            return Transform::Failed;
        }
        if !self.finished() {
            if offset == state.offset {
                state.offset += block.len() as u64;
                return Transform::Deferred;
            }
            return Transform::Skipped;
        }
        if offset < state.offset {
            return Transform::Skipped;
        }
        if offset > state.offset {
            warn!(offset, expected = state.offset, "md5 block out of order");
            state.succeeded = false;
            return Transform::Failed;
        }
        state.md5.update(block);
        state.offset += block.len() as u64;
        Transform::Hashed
    }

    /// Wait (bounded) for catch-up to finish and return the digest of everything hashed,
    /// or `None` if verification is disabled or the hash could not be completed.
    pub async fn transform_final_block(&self, context: &impl Clock) -> Option<[u8; 16]> {
        if !self.check {
            return None;
        }
        let mut attempts = 0;
        while !self.finished() {
            attempts += 1;
            if attempts > FINAL_BLOCK_WAIT_ATTEMPTS {
                warn!("timed out waiting for md5 catch-up");
                return None;
            }
            context.sleep(FINAL_BLOCK_WAIT_INTERVAL).await;
        }
        let state = self.state.lock().unwrap();
        if !state.succeeded {
            return None;
        }
        Some(state.md5.clone().finalize().into())
    }
}
