//! Fixed-size buffer arena shared by in-flight transfers.
//!
//! A [MemoryPool] hands out [Buffer]s of a single size fixed at construction. Cells
//! are allocated lazily, up to a ceiling, and are never freed while the pool lives:
//! a cell only moves between the free list and the in-use set.
//!
//! # Checkout
//!
//! [MemoryPool::checkout] never blocks. It takes the head of the free list if one
//! exists, otherwise allocates a new cell while below the ceiling, otherwise returns
//! `None`. Exhaustion is not an error: callers are expected to retry (see the
//! transfer crate's memory manager) and to apply backpressure.
//!
//! # Return
//!
//! A [Buffer] returns itself to the pool that issued it when dropped, so every exit
//! path (including errors and cancellation) releases it. [MemoryPool::release] is an
//! explicit alias for dropping. Buffers that were not issued by a live pool are
//! simply deallocated; they never touch any free list.
//!
//! # Thread Safety
//!
//! [MemoryPool] is `Send + Sync` and cheap to clone. One lock guards only the free
//! list and its counters; the registry of in-use cells, consulted on return to
//! locate and validate a buffer's cell, is guarded separately.
//!
//! # Pool Lifecycle
//!
//! Buffers hold a weak reference to the pool. If a buffer outlives its pool, it is
//! deallocated directly when dropped.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};
use tracing::trace;

/// Configuration for a [MemoryPool].
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of every buffer handed out by the pool.
    pub buffer_size: NonZeroUsize,

    /// Maximum number of cells the pool may ever allocate.
    pub max_cells: usize,
}

/// A cell of the arena.
///
/// While free, `data` holds the cell's storage and `next` links to the next free
/// cell. While in use, `data` is `None` (the storage lives in a [Buffer]).
struct Cell {
    next: Option<usize>,
    data: Option<Box<[u8]>>,
}

struct FreeList {
    head: Option<usize>,
    available: usize,
    cells: Vec<Cell>,
}

struct Inner {
    buffer_size: usize,
    max_cells: usize,
    free: Mutex<FreeList>,
    in_use: Mutex<HashMap<usize, usize>>,
    exhausted: AtomicU64,
}

impl Inner {
    /// Return `data` to the free list, if it was issued by this pool.
    fn put(&self, data: Box<[u8]>) {
        let Some(index) = self.in_use.lock().unwrap().remove(&address(&data)) else {
            trace!("ignoring buffer not issued by this pool");
            return;
        };
        assert_eq!(data.len(), self.buffer_size, "buffer size changed");

        let mut free = self.free.lock().unwrap();
        let head = free.head;
        let cell = &mut free.cells[index];
        cell.data = Some(data);
        cell.next = head;
        free.head = Some(index);
        free.available += 1;
    }
}

/// Identity of a buffer's storage.
fn address(data: &[u8]) -> usize {
    data.as_ptr() as usize
}

/// Fixed-size buffer arena.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<Inner>,
}

impl MemoryPool {
    /// Create a new, empty pool. No cell is allocated until first checked out.
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer_size: cfg.buffer_size.get(),
                max_cells: cfg.max_cells,
                free: Mutex::new(FreeList {
                    head: None,
                    available: 0,
                    cells: Vec::new(),
                }),
                in_use: Mutex::new(HashMap::new()),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a buffer, or return `None` if every cell is in use.
    pub fn checkout(&self) -> Option<Buffer> {
        let (index, data) = {
            let mut free = self.inner.free.lock().unwrap();
            if let Some(index) = free.head {
                let cell = &mut free.cells[index];
                let next = cell.next.take();
                let data = cell.data.take();
                free.head = next;
                free.available -= 1;
                (index, data)
            } else if free.cells.len() < self.inner.max_cells {
                // Reserve the cell now, allocate its storage outside of the lock
                free.cells.push(Cell {
                    next: None,
                    data: None,
                });
                (free.cells.len() - 1, None)
            } else {
                drop(free);
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let data = data.unwrap_or_else(|| {
            trace!(cell = index, "allocating cell");
            vec![0u8; self.inner.buffer_size].into_boxed_slice()
        });
        self.inner
            .in_use
            .lock()
            .unwrap()
            .insert(address(&data), index);
        Some(Buffer {
            data: Some(data),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Return a buffer to the pool that issued it.
    ///
    /// Equivalent to dropping the buffer. Buffers issued by another pool go back to
    /// that pool; detached buffers are deallocated. Neither affects this pool.
    pub fn release(&self, buffer: Buffer) {
        drop(buffer);
    }

    /// Size of every buffer issued by this pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Maximum number of cells this pool may allocate.
    pub fn max_cells(&self) -> usize {
        self.inner.max_cells
    }

    /// Number of cells allocated so far.
    pub fn allocated(&self) -> usize {
        self.inner.free.lock().unwrap().cells.len()
    }

    /// Number of allocated cells sitting on the free list.
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().available
    }

    /// Number of cells currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.lock().unwrap().len()
    }

    /// Number of checkouts that failed because the pool was exhausted.
    pub fn exhausted(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }
}

/// A buffer checked out of a [MemoryPool].
///
/// Returns itself to its pool when dropped.
pub struct Buffer {
    data: Option<Box<[u8]>>,
    pool: Weak<Inner>,
}

impl Buffer {
    fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }
}

impl From<Vec<u8>> for Buffer {
    /// Create a buffer that does not belong to any pool.
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: Some(data.into_boxed_slice()),
            pool: Weak::new(),
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data_mut()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl AsMut<[u8]> for Buffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.data_mut()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data().len())
            .field("pooled", &(self.pool.strong_count() > 0))
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.put(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{collections::HashSet, thread};

    fn pool(buffer_size: usize, max_cells: usize) -> MemoryPool {
        MemoryPool::new(Config {
            buffer_size: NonZeroUsize::new(buffer_size).unwrap(),
            max_cells,
        })
    }

    fn assert_conserved(pool: &MemoryPool) {
        assert_eq!(pool.available() + pool.in_use(), pool.allocated());
        assert!(pool.allocated() <= pool.max_cells());
    }

    #[test_traced]
    fn test_lazy_allocation() {
        let pool = pool(1024, 4);
        assert_eq!(pool.allocated(), 0);

        let first = pool.checkout().unwrap();
        assert_eq!(first.len(), 1024);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.available(), 0);

        // Returning keeps the cell allocated
        drop(first);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.available(), 1);

        // The free cell is reused before allocating another
        let _second = pool.checkout().unwrap();
        assert_eq!(pool.allocated(), 1);
        assert_conserved(&pool);
    }

    #[test_traced]
    fn test_exhaustion() {
        let pool = pool(64, 3);
        let held: Vec<_> = (0..3).map(|_| pool.checkout().unwrap()).collect();
        assert!(pool.checkout().is_none());
        assert_eq!(pool.exhausted(), 1);

        pool.release(held.into_iter().next().unwrap());
        assert!(pool.checkout().is_some());
    }

    #[test_traced]
    fn test_reuse_returns_same_storage() {
        let pool = pool(64, 1);
        let mut buffer = pool.checkout().unwrap();
        buffer[0] = 7;
        let first = buffer.as_ptr();
        drop(buffer);

        let buffer = pool.checkout().unwrap();
        assert_eq!(buffer.as_ptr(), first);
        assert_eq!(buffer[0], 7);
    }

    #[test_traced]
    fn test_release_unknown_buffer() {
        let pool = pool(64, 2);
        let held = pool.checkout().unwrap();
        let before = (pool.allocated(), pool.available(), pool.in_use());

        // A detached buffer of the right size
        pool.release(Buffer::from(vec![0u8; 64]));
        assert_eq!((pool.allocated(), pool.available(), pool.in_use()), before);

        // A buffer issued by another pool returns to its own pool
        let other = self::pool(64, 2);
        let foreign = other.checkout().unwrap();
        pool.release(foreign);
        assert_eq!((pool.allocated(), pool.available(), pool.in_use()), before);
        assert_eq!(other.available(), 1);

        drop(held);
        assert_conserved(&pool);
    }

    #[test_traced]
    fn test_buffer_outlives_pool() {
        let pool = pool(64, 1);
        let buffer = pool.checkout().unwrap();
        drop(pool);
        assert_eq!(buffer.len(), 64);
        drop(buffer);
    }

    #[test_traced]
    fn test_random_conservation() {
        let mut rng = StdRng::seed_from_u64(42);
        let pool = pool(32, 16);
        let mut held = Vec::new();
        for _ in 0..10_000 {
            if rng.gen_bool(0.5) {
                match pool.checkout() {
                    Some(buffer) => held.push(buffer),
                    None => assert_eq!(held.len(), 16),
                }
            } else if !held.is_empty() {
                let index = rng.gen_range(0..held.len());
                pool.release(held.swap_remove(index));
            }
            assert_conserved(&pool);
            assert_eq!(pool.in_use(), held.len());

            // No storage is ever issued twice
            let addresses: HashSet<_> = held.iter().map(|buffer| buffer.as_ptr()).collect();
            assert_eq!(addresses.len(), held.len());
        }
    }

    #[test_traced]
    fn test_concurrent_checkout() {
        let pool = pool(128, 8);
        let handles: Vec<_> = (0..8)
            .map(|seed| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..1_000 {
                        let Some(mut buffer) = pool.checkout() else {
                            continue;
                        };

                        // Stamp the buffer; a concurrent holder would clobber the stamp
                        let stamp = rng.gen::<u8>();
                        buffer.fill(stamp);
                        thread::yield_now();
                        assert!(buffer.iter().all(|byte| *byte == stamp));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
        assert_conserved(&pool);
    }
}
