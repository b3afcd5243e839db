//! Hand out pooled buffers to controllers.
//!
//! The [MemoryManager] sizes a [MemoryPool] from the [Config] (one buffer per
//! `block_size` that fits in the cache, up to `memory_cells_maximum`) and adds the
//! acquisition policies controllers need on top of the pool's non-blocking checkout:
//! polling with a fixed delay until a buffer frees up, and all-or-nothing acquisition
//! of several buffers for scatter/gather I/O.
//!
//! Buffers return to the pool when dropped, so every exit path of a controller
//! (including errors and cancellation) releases what it acquired.

use crate::{Budget, Config, Error};
use courier_runtime::{
    pool::{self, Buffer, MemoryPool},
    Clock,
};
use std::{num::NonZeroUsize, time::Duration};
use tracing::{debug, warn};

/// Buffer acquisition for controllers.
#[derive(Clone)]
pub struct MemoryManager<E: Clock> {
    context: E,
    pool: MemoryPool,

    retry_attempts: usize,
    retry_interval: Duration,
}

impl<E: Clock> MemoryManager<E> {
    /// Create a memory manager holding `budget.cells` buffers of `cfg.block_size`.
    ///
    /// `budget` must come from [Config::budget] on the same `cfg`.
    pub fn new(context: E, cfg: &Config, budget: Budget) -> Self {
        let buffer_size = NonZeroUsize::new(cfg.block_size).expect("block size must be positive");
        let max_cells = budget.cells;
        debug!(
            buffer_size = buffer_size.get(),
            max_cells, "initialized memory manager"
        );
        Self {
            context,
            pool: MemoryPool::new(pool::Config {
                buffer_size,
                max_cells,
            }),
            retry_attempts: cfg.buffer_retry_attempts,
            retry_interval: cfg.buffer_retry_interval,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Size of every buffer.
    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size()
    }

    /// Check out a buffer, or return `None` if the pool is exhausted.
    pub fn require_buffer(&self) -> Option<Buffer> {
        self.pool.checkout()
    }

    /// Return a buffer (equivalent to dropping it).
    pub fn release_buffer(&self, buffer: Buffer) {
        self.pool.release(buffer);
    }

    /// Check out `count` buffers, or none at all.
    pub fn require_buffers(&self, count: usize) -> Option<Vec<Buffer>> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            // Dropping a partial acquisition returns it to the pool
            buffers.push(self.pool.checkout()?);
        }
        Some(buffers)
    }

    /// Check out a buffer, polling an exhausted pool until one frees up.
    ///
    /// `canceled` is checked before every attempt. Fails with [Error::OutOfMemory] once
    /// the configured number of attempts is spent.
    pub async fn require_buffer_with_retry(
        &self,
        canceled: impl Fn() -> bool,
    ) -> Result<Buffer, Error> {
        self.retry(canceled, || self.require_buffer()).await
    }

    /// Check out `count` buffers (all or nothing), polling an exhausted pool until enough
    /// free up.
    pub async fn require_buffers_with_retry(
        &self,
        count: usize,
        canceled: impl Fn() -> bool,
    ) -> Result<Vec<Buffer>, Error> {
        if count > self.pool.max_cells() {
            return Err(Error::OutOfMemory);
        }
        self.retry(canceled, || self.require_buffers(count)).await
    }

    async fn retry<T>(
        &self,
        canceled: impl Fn() -> bool,
        mut acquire: impl FnMut() -> Option<T>,
    ) -> Result<T, Error> {
        for attempt in 0..self.retry_attempts {
            if canceled() {
                return Err(Error::Canceled);
            }
            if let Some(acquired) = acquire() {
                return Ok(acquired);
            }
            if attempt + 1 < self.retry_attempts {
                self.context.sleep(self.retry_interval).await;
            }
        }
        warn!(
            attempts = self.retry_attempts,
            in_use = self.pool.in_use(),
            "memory pool exhausted"
        );
        Err(Error::OutOfMemory)
    }
}
