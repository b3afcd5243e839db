//! Size range requests and apply backpressure from aggregate in-flight volume.
//!
//! The [Pacer] sums two quantities over every registered controller:
//!
//! - _scheduled volume_: bytes controllers will transfer but have not yet read into
//!   memory, and
//! - _buffered volume_: bytes read into memory but not yet written out.
//!
//! From these it derives the size of the next range request (an even share of the
//! scheduled volume per parallel operation, clamped to the block size bounds) and
//! whether a controller should hold off reading more (when the cache cannot fit
//! another range request).
//!
//! Each controller reports through its own [Volume]. A volume may observe events
//! before it is registered: registration adds its accumulated volume to the totals and
//! deregistration (or drop) removes whatever it still contributes, so the totals never
//! double count nor leak a controller's volume.

use crate::{
    config::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
    Config,
};
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};
use tracing::trace;

/// Add `delta` to `counter`, panicking if the counter would become negative.
fn adjust(counter: &AtomicI64, delta: i64, name: &str) {
    if delta == 0 {
        return;
    }
    let updated = counter.fetch_add(delta, Ordering::SeqCst) + delta;
    assert!(updated >= 0, "{name} volume became negative: {updated}");
}

/// Aggregate in-flight volume across controllers.
pub struct Pacer {
    parallel_operations: u64,
    maximum_cache_size: u64,

    scheduled: AtomicI64,
    buffered: AtomicI64,
}

impl Pacer {
    /// Create a pacer for `cfg`, budgeting `cache_size` bytes of buffered data.
    pub fn new(cfg: &Config, cache_size: usize) -> Arc<Self> {
        Arc::new(Self {
            parallel_operations: cfg.parallel_operations as u64,
            maximum_cache_size: cache_size as u64,
            scheduled: AtomicI64::new(0),
            buffered: AtomicI64::new(0),
        })
    }

    /// Create an unregistered volume for a controller.
    pub fn volume(self: &Arc<Self>) -> Volume {
        Volume {
            pacer: self.clone(),
            state: Mutex::new(VolumeState::default()),
        }
    }

    /// Bytes scheduled across registered controllers.
    pub fn total_scheduled_volume(&self) -> u64 {
        self.scheduled.load(Ordering::SeqCst) as u64
    }

    /// Bytes buffered across registered controllers.
    pub fn total_buffered_volume(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst) as u64
    }

    /// Size of the next range request.
    pub fn range_request_size(&self) -> u64 {
        (self.total_scheduled_volume() / self.parallel_operations)
            .clamp(MIN_BLOCK_SIZE as u64, MAX_BLOCK_SIZE as u64)
    }

    /// Whether controllers should stop reading until buffered data drains.
    pub fn request_hold(&self) -> bool {
        let free = self.maximum_cache_size as i64 - self.buffered.load(Ordering::SeqCst);
        free < self.range_request_size() as i64
    }
}

#[derive(Default)]
struct VolumeState {
    registered: bool,
    deregistered: bool,

    /// Declared length of the transfer.
    total: i64,
    /// Bytes read into memory so far, whether or not they were written out since.
    added: i64,

    /// Contribution to the scheduled total.
    scheduled: i64,
    /// Contribution to the buffered total.
    buffered: i64,
}

impl VolumeState {
    /// Recompute the scheduled contribution, returning how much it changed.
    fn reschedule(&mut self) -> i64 {
        let scheduled = self.total.saturating_sub(self.added).max(0);
        let delta = scheduled - self.scheduled;
        self.scheduled = scheduled;
        delta
    }
}

/// A controller's contribution to the [Pacer].
pub struct Volume {
    pacer: Arc<Pacer>,
    state: Mutex<VolumeState>,
}

impl Volume {
    /// Start contributing to the totals, including any volume observed so far.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn register(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.registered, "volume already registered");
        state.registered = true;
        adjust(&self.pacer.scheduled, state.scheduled, "scheduled");
        adjust(&self.pacer.buffered, state.buffered, "buffered");
        trace!(
            scheduled = state.scheduled,
            buffered = state.buffered,
            "registered volume"
        );
    }

    /// Stop contributing to the totals, removing whatever this volume still contributes.
    ///
    /// # Panics
    ///
    /// Panics if the volume is not registered or was already deregistered.
    pub fn deregister(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.registered, "volume not registered");
        assert!(!state.deregistered, "volume already deregistered");
        state.deregistered = true;
        adjust(&self.pacer.scheduled, -state.scheduled, "scheduled");
        adjust(&self.pacer.buffered, -state.buffered, "buffered");
    }

    /// Set the total number of bytes this controller will transfer.
    ///
    /// Bytes already read into memory are not scheduled again.
    pub fn total_length_changed(&self, total: u64) {
        let total = i64::try_from(total).unwrap_or(i64::MAX);
        self.update(|state| {
            state.total = total;
            (state.reschedule(), 0)
        });
    }

    /// Record `len` bytes read into memory, moving them from scheduled to buffered.
    pub fn data_added(&self, len: u64) {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        self.update(|state| {
            let added = len.min(i64::MAX - state.buffered);
            state.buffered += added;
            state.added = state.added.saturating_add(added);
            (state.reschedule(), added)
        });
    }

    /// Record `len` bytes written out of memory.
    ///
    /// Removing more than was added only removes what was added.
    pub fn data_removed(&self, len: u64) {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        self.update(|state| {
            let removed = len.min(state.buffered);
            state.buffered -= removed;
            (0, -removed)
        });
    }

    /// Apply a change to this volume, forwarding it to the totals while registered.
    fn update(&self, f: impl FnOnce(&mut VolumeState) -> (i64, i64)) {
        let mut state = self.state.lock().unwrap();
        let (scheduled, buffered) = f(&mut state);
        if state.registered && !state.deregistered {
            adjust(&self.pacer.scheduled, scheduled, "scheduled");
            adjust(&self.pacer.buffered, buffered, "buffered");
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        // A failed assertion already left the totals inconsistent
        if thread::panicking() {
            return;
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.registered && !state.deregistered {
            state.deregistered = true;
            adjust(&self.pacer.scheduled, -state.scheduled, "scheduled");
            adjust(&self.pacer.buffered, -state.buffered, "buffered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::panic::{self, AssertUnwindSafe};

    const MIB: u64 = 1024 * 1024;

    fn pacer(parallel_operations: usize, cache: usize) -> Arc<Pacer> {
        let cfg = Config {
            parallel_operations,
            maximum_cache_size: Some(cache),
            ..Config::default()
        };
        Pacer::new(&cfg, cache)
    }

    #[test_traced]
    fn test_range_request_size() {
        let pacer = pacer(4, 200 * MIB as usize);
        let volume = pacer.volume();
        volume.register();

        // Clamped to the minimum
        assert_eq!(pacer.range_request_size(), MIN_BLOCK_SIZE as u64);

        // Even share per operation
        volume.total_length_changed(4 * 10 * MIB);
        assert_eq!(pacer.range_request_size(), 10 * MIB);

        // Clamped to the maximum
        volume.total_length_changed(4 * 1024 * MIB);
        assert_eq!(pacer.range_request_size(), MAX_BLOCK_SIZE as u64);
    }

    #[test_traced]
    fn test_buffering_moves_scheduled_volume() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.register();
        volume.total_length_changed(100);

        // A partial buffer leaves the rest scheduled
        volume.data_added(60);
        assert_eq!(pacer.total_scheduled_volume(), 40);
        assert_eq!(pacer.total_buffered_volume(), 60);

        // Writing out does not reschedule
        volume.data_removed(60);
        assert_eq!(pacer.total_scheduled_volume(), 40);
        assert_eq!(pacer.total_buffered_volume(), 0);

        // Buffering past the declared length never schedules negative volume
        volume.data_added(70);
        assert_eq!(pacer.total_scheduled_volume(), 0);
        assert_eq!(pacer.total_buffered_volume(), 70);

        // Growing the transfer schedules only what was not yet buffered
        volume.total_length_changed(150);
        assert_eq!(pacer.total_scheduled_volume(), 20);
    }

    #[test_traced]
    fn test_request_hold() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.register();
        volume.total_length_changed(300 * MIB);
        assert_eq!(pacer.range_request_size(), MAX_BLOCK_SIZE as u64);
        assert!(!pacer.request_hold());

        // 10 MiB buffered leaves less room than one 100 MiB request
        volume.data_added(10 * MIB);
        assert!(pacer.request_hold());

        // Draining releases the hold
        volume.data_removed(10 * MIB);
        assert!(!pacer.request_hold());
    }

    #[test_traced]
    fn test_register_reconciles_prior_volume() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.total_length_changed(10);
        volume.data_added(4);
        assert_eq!(pacer.total_scheduled_volume(), 0);
        assert_eq!(pacer.total_buffered_volume(), 0);

        volume.register();
        assert_eq!(pacer.total_scheduled_volume(), 6);
        assert_eq!(pacer.total_buffered_volume(), 4);

        volume.deregister();
        assert_eq!(pacer.total_scheduled_volume(), 0);
        assert_eq!(pacer.total_buffered_volume(), 0);

        // Events after deregistration are not forwarded
        volume.data_added(5);
        assert_eq!(pacer.total_buffered_volume(), 0);
    }

    #[test_traced]
    fn test_removal_clamped() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.register();
        volume.data_added(5);
        volume.data_removed(50);
        assert_eq!(pacer.total_buffered_volume(), 0);
    }

    #[test_traced]
    fn test_drop_deregisters() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.register();
        volume.total_length_changed(10);
        drop(volume);
        assert_eq!(pacer.total_scheduled_volume(), 0);
    }

    #[test]
    #[should_panic(expected = "volume already registered")]
    fn test_double_register() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.register();
        volume.register();
    }

    #[test]
    #[should_panic(expected = "volume not registered")]
    fn test_deregister_before_register() {
        let pacer = pacer(1, 100 * MIB as usize);
        pacer.volume().deregister();
    }

    #[test_traced]
    fn test_drop_after_misuse() {
        let pacer = pacer(1, 100 * MIB as usize);
        let volume = pacer.volume();
        volume.register();
        volume.total_length_changed(10);
        volume.data_added(3);

        // The failed registration poisons the volume's lock
        let result = panic::catch_unwind(AssertUnwindSafe(|| volume.register()));
        assert!(result.is_err());

        drop(volume);
        assert_eq!(pacer.total_scheduled_volume(), 0);
        assert_eq!(pacer.total_buffered_volume(), 0);
    }

    #[test_traced]
    fn test_random_events() {
        let pacer = pacer(4, 100 * MIB as usize);
        let handles: Vec<_> = (0..8)
            .map(|seed| {
                let pacer = pacer.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let volume = pacer.volume();
                    let mut registered = false;
                    for _ in 0..1_000 {
                        match rng.gen_range(0..4) {
                            0 => volume.total_length_changed(rng.gen_range(0..MIB)),
                            1 => volume.data_added(rng.gen_range(0..MIB)),
                            2 => volume.data_removed(rng.gen_range(0..MIB)),
                            _ if !registered => {
                                volume.register();
                                registered = true;
                            }
                            _ => {}
                        }
                        assert!(pacer.scheduled.load(Ordering::SeqCst) >= 0);
                        assert!(pacer.buffered.load(Ordering::SeqCst) >= 0);
                    }
                    if registered && rng.gen_bool(0.5) {
                        volume.deregister();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pacer.total_scheduled_volume(), 0);
        assert_eq!(pacer.total_buffered_volume(), 0);
    }
}
