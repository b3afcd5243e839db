//! Configuration shared by the scheduler and the components it owns.

use crate::Error;
use std::time::Duration;

/// Smallest allowed block size.
pub const MIN_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Largest allowed block size.
pub const MAX_BLOCK_SIZE: usize = 100 * 1024 * 1024;

/// Memory budgeted per parallel operation when the cache size is derived.
pub const MEMORY_PER_OPERATION: usize = 12 * 1024 * 1024;

/// Largest cache ever derived from available memory.
#[cfg(target_pointer_width = "64")]
pub const MAX_CACHE_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// Largest cache ever derived from available memory.
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_CACHE_SIZE: usize = 512 * 1024 * 1024;

/// Configuration for a [crate::scheduler::TransferScheduler].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of work units running at once.
    pub parallel_operations: usize,

    /// Size of each pooled buffer, in `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`.
    pub block_size: usize,

    /// Bytes the memory pool may hold.
    ///
    /// If `None`, derived from `parallel_operations` and the physical memory available
    /// at construction (see [Config::cache_size]).
    pub maximum_cache_size: Option<usize>,

    /// Upper bound on the number of pooled buffers, regardless of cache size.
    pub memory_cells_maximum: usize,

    /// Number of times to poll the pool before failing with [Error::OutOfMemory].
    pub buffer_retry_attempts: usize,

    /// Delay between polls of an exhausted pool.
    pub buffer_retry_interval: Duration,

    /// Delay before the dispatch loop looks for work again when no controller has any.
    pub dispatch_idle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            parallel_operations: cpus * 8,
            block_size: MIN_BLOCK_SIZE,
            maximum_cache_size: None,
            memory_cells_maximum: 8192,
            buffer_retry_attempts: 10,
            buffer_retry_interval: Duration::from_millis(100),
            dispatch_idle_interval: Duration::from_millis(10),
        }
    }
}

impl Config {
    /// Ensure the configuration is usable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.parallel_operations == 0 {
            return Err(Error::InvalidConfig("parallel_operations must be positive"));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(Error::InvalidConfig("block_size out of range"));
        }
        if matches!(self.maximum_cache_size, Some(size) if size < MAX_BLOCK_SIZE) {
            return Err(Error::InvalidConfig(
                "maximum_cache_size must be at least MAX_BLOCK_SIZE",
            ));
        }
        if self.memory_cells_maximum == 0 {
            return Err(Error::InvalidConfig("memory_cells_maximum must be positive"));
        }
        if self.buffer_retry_attempts == 0 {
            return Err(Error::InvalidConfig("buffer_retry_attempts must be positive"));
        }
        Ok(())
    }

    /// Bytes the memory pool may hold.
    pub fn cache_size(&self) -> usize {
        self.maximum_cache_size.unwrap_or_else(|| {
            derive_cache_size(self.parallel_operations, available_physical_memory())
        })
    }

    /// Validate the configuration and fix its memory budget.
    ///
    /// The cache size is derived (probing available memory) exactly once, so every
    /// component sized from the returned [Budget] agrees on it.
    pub fn budget(&self) -> Result<Budget, Error> {
        self.validate()?;
        let cache_size = self.cache_size();
        let cells = cells(cache_size, self.block_size, self.memory_cells_maximum);
        if cells == 0 {
            return Err(Error::InvalidConfig("cache cannot hold a single block"));
        }
        Ok(Budget { cache_size, cells })
    }
}

/// Memory budget resolved from a [Config].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budget {
    /// Bytes the memory pool may hold.
    pub cache_size: usize,

    /// Number of buffers the memory pool may allocate.
    pub cells: usize,
}

/// Derive a cache size from parallelism and (if known) available physical memory.
pub(crate) fn derive_cache_size(parallel_operations: usize, available: Option<u64>) -> usize {
    let mut size = MEMORY_PER_OPERATION
        .saturating_mul(parallel_operations)
        .min(MAX_CACHE_SIZE);
    if let Some(available) = available {
        size = size.min(usize::try_from(available / 2).unwrap_or(usize::MAX));
    }
    size
}

/// Number of buffers of `block_size` that fit in `cache_size`.
pub(crate) fn cells(cache_size: usize, block_size: usize, maximum: usize) -> usize {
    (cache_size / block_size).min(maximum)
}

/// Physical memory currently available, if the platform reports it.
#[cfg(target_os = "linux")]
fn available_physical_memory() -> Option<u64> {
    // SAFETY: sysconf is safe to call.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_AVPHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some((pages as u64).saturating_mul(page_size as u64))
}

#[cfg(not(target_os = "linux"))]
fn available_physical_memory() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test_case(Config { parallel_operations: 0, ..Config::default() }; "no parallelism")]
    #[test_case(Config { block_size: MIN_BLOCK_SIZE - 1, ..Config::default() }; "block too small")]
    #[test_case(Config { block_size: MAX_BLOCK_SIZE + 1, ..Config::default() }; "block too large")]
    #[test_case(Config { maximum_cache_size: Some(MAX_BLOCK_SIZE - 1), ..Config::default() }; "cache too small")]
    #[test_case(Config { memory_cells_maximum: 0, ..Config::default() }; "no cells")]
    #[test_case(Config { buffer_retry_attempts: 0, ..Config::default() }; "no attempts")]
    fn test_invalid(cfg: Config) {
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_derive_cache_size() {
        // Bounded by parallelism
        assert_eq!(derive_cache_size(1, None), 12 * MIB);
        assert_eq!(derive_cache_size(4, Some(u64::MAX)), 48 * MIB);

        // Bounded by half of available memory
        assert_eq!(derive_cache_size(4, Some(40 * MIB as u64)), 20 * MIB);

        // Bounded by the hard ceiling
        assert_eq!(derive_cache_size(100_000, None), MAX_CACHE_SIZE);
    }

    #[test]
    fn test_cells() {
        assert_eq!(cells(12 * MIB, 4 * MIB, 8192), 3);
        assert_eq!(cells(12 * MIB, 5 * MIB, 8192), 2);
        assert_eq!(cells(12 * MIB, 4 * MIB, 2), 2);
        assert_eq!(cells(MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, 8192), 25);
    }

    #[test]
    fn test_explicit_budget() {
        let cfg = Config {
            maximum_cache_size: Some(200 * MIB),
            block_size: 8 * MIB,
            ..Config::default()
        };
        assert_eq!(
            cfg.budget().unwrap(),
            Budget {
                cache_size: 200 * MIB,
                cells: 25,
            }
        );
    }

    #[test]
    fn test_budget_without_cells() {
        // One operation derives at most 12 MiB, less than one 16 MiB block
        let cfg = Config {
            parallel_operations: 1,
            block_size: 16 * MIB,
            maximum_cache_size: None,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert!(matches!(cfg.budget(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_budget_checks_config() {
        let cfg = Config {
            parallel_operations: 0,
            ..Config::default()
        };
        assert!(matches!(cfg.budget(), Err(Error::InvalidConfig(_))));
    }
}
