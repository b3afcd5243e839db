//! Drive many transfer jobs through a bounded number of concurrent work units.
//!
//! # Overview
//!
//! Each job is a [Controller]: a state machine that knows whether it has work available,
//! whether it has finished, and how to run one more step. Callers submit controllers with
//! [TransferScheduler::execute] and await the returned [Completion].
//!
//! # Dispatch
//!
//! A single dispatch loop moves submitted jobs from an unbounded intake queue into an
//! active set of at most `parallel_operations` jobs. On each pass it picks one active job
//! with work available uniformly at random, waits for one of `parallel_operations`
//! permits, and spawns one step of that job. When no job has work available, the loop
//! sleeps for `dispatch_idle_interval` and looks again.
//!
//! A step resolving to `Ok(true)` completes the job. A step that fails or panics fails
//! the job with [Error::Uncategorized] (or [Error::Canceled] if the step observed
//! cancellation). Neither ever stops the loop.
//!
//! # Shutdown
//!
//! [TransferScheduler::close] stops intake, signals the [Cancellation] token handed to
//! every step, resolves all unfinished jobs with [Error::Canceled], and waits until every
//! in-flight step has returned its permit. Steps are not interrupted: they observe the
//! token and return on their own.

use crate::Error;
use futures::{channel::oneshot, future::BoxFuture, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

mod engine;
pub use engine::TransferScheduler;
mod metrics;

/// A job driven by the [TransferScheduler].
pub trait Controller: Send + Sync + 'static {
    /// Returns true if a step could make progress right now.
    fn has_work(&self) -> bool;

    /// Returns true once the job needs no more steps.
    fn is_finished(&self) -> bool;

    /// Run one step of the job.
    ///
    /// Resolves to `true` when this step finished the job.
    fn do_work(self: Arc<Self>, cancel: Cancellation) -> BoxFuture<'static, Result<bool, Error>>;
}

/// Token signaled when the scheduler shuts down.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// Returns true once the scheduler has been closed.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Resolves when a submitted job completes, fails, or is canceled.
pub struct Completion {
    receiver: oneshot::Receiver<Result<(), Error>>,
}

impl Completion {
    fn new(receiver: oneshot::Receiver<Result<(), Error>>) -> Self {
        Self { receiver }
    }
}

impl Future for Completion {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(Error::Canceled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use courier_macros::test_traced;
    use courier_runtime::{tokio, Clock, Metrics, Runner, Spawner};
    use futures::future::join_all;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// A job that takes a fixed number of steps, one at a time.
    struct Steps {
        context: tokio::Context,
        remaining: AtomicUsize,
        busy: AtomicBool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Steps {
        fn new(
            context: tokio::Context,
            steps: usize,
            running: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        ) -> Arc<Self> {
            Arc::new(Self {
                context,
                remaining: AtomicUsize::new(steps),
                busy: AtomicBool::new(false),
                running,
                peak,
            })
        }
    }

    impl Controller for Steps {
        fn has_work(&self) -> bool {
            !self.busy.load(Ordering::Acquire) && !self.is_finished()
        }

        fn is_finished(&self) -> bool {
            self.remaining.load(Ordering::Acquire) == 0
        }

        fn do_work(self: Arc<Self>, _: Cancellation) -> BoxFuture<'static, Result<bool, Error>> {
            self.busy.store(true, Ordering::Release);
            async move {
                let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
                self.peak.fetch_max(running, Ordering::AcqRel);
                self.context.sleep(Duration::from_millis(5)).await;
                self.running.fetch_sub(1, Ordering::AcqRel);
                let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
                self.busy.store(false, Ordering::Release);
                Ok(remaining == 0)
            }
            .boxed()
        }
    }

    /// A job whose first step fails or panics.
    struct Broken {
        panic: bool,
    }

    impl Controller for Broken {
        fn has_work(&self) -> bool {
            true
        }

        fn is_finished(&self) -> bool {
            false
        }

        fn do_work(self: Arc<Self>, _: Cancellation) -> BoxFuture<'static, Result<bool, Error>> {
            async move {
                if self.panic {
                    panic!("step exploded");
                }
                Err(Error::Stream("connection reset".into()))
            }
            .boxed()
        }
    }

    /// A job that never has work.
    struct Idle;

    impl Controller for Idle {
        fn has_work(&self) -> bool {
            false
        }

        fn is_finished(&self) -> bool {
            false
        }

        fn do_work(self: Arc<Self>, _: Cancellation) -> BoxFuture<'static, Result<bool, Error>> {
            async { Ok(false) }.boxed()
        }
    }

    /// A job whose single step runs until canceled.
    struct Waiting {
        context: tokio::Context,
        started: AtomicBool,
    }

    impl Controller for Waiting {
        fn has_work(&self) -> bool {
            !self.started.load(Ordering::Acquire)
        }

        fn is_finished(&self) -> bool {
            false
        }

        fn do_work(
            self: Arc<Self>,
            cancel: Cancellation,
        ) -> BoxFuture<'static, Result<bool, Error>> {
            self.started.store(true, Ordering::Release);
            async move {
                while !cancel.is_canceled() {
                    self.context.sleep(Duration::from_millis(1)).await;
                }
                Err(Error::Canceled)
            }
            .boxed()
        }
    }

    fn config(parallel_operations: usize) -> Config {
        Config {
            parallel_operations,
            maximum_cache_size: Some(crate::config::MAX_BLOCK_SIZE),
            dispatch_idle_interval: Duration::from_millis(1),
            ..Config::default()
        }
    }

    #[test_traced]
    fn test_bounded_concurrency() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let scheduler = TransferScheduler::new(context.clone(), config(3)).unwrap();
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let completions: Vec<_> = (0..10)
                .map(|_| {
                    let job = Steps::new(context.clone(), 4, running.clone(), peak.clone());
                    scheduler.execute(job).unwrap()
                })
                .collect();
            for result in join_all(completions).await {
                result.unwrap();
            }
            let peak = peak.load(Ordering::Acquire);
            assert!((1..=3).contains(&peak), "peak concurrency {peak}");
            assert_eq!(running.load(Ordering::Acquire), 0);
            scheduler.close().await;

            let buffer = context.encode();
            assert!(buffer.contains("scheduler_completed_total 10"));
            assert!(buffer.contains("scheduler_dispatched_total 40"));
            assert!(buffer.contains("scheduler_active 0"));
            assert!(buffer.contains("scheduler_queued 0"));
        });
    }

    #[test_traced]
    fn test_failed_steps() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let scheduler = TransferScheduler::new(context.clone(), config(2)).unwrap();
            let failed = scheduler
                .execute(Arc::new(Broken { panic: false }))
                .unwrap();
            let panicked = scheduler.execute(Arc::new(Broken { panic: true })).unwrap();
            let job = Steps::new(
                context.clone(),
                2,
                Arc::new(AtomicUsize::new(0)),
                Arc::new(AtomicUsize::new(0)),
            );
            let healthy = scheduler.execute(job).unwrap();

            assert!(matches!(
                failed.await,
                Err(Error::Uncategorized(msg)) if msg.contains("connection reset")
            ));
            assert!(matches!(
                panicked.await,
                Err(Error::Uncategorized(msg)) if msg == "step exploded"
            ));
            healthy.await.unwrap();
            scheduler.close().await;

            let buffer = context.encode();
            assert!(buffer.contains("scheduler_failed_total 2"));
            assert!(buffer.contains("scheduler_completed_total 1"));
        });
    }

    #[test_traced]
    fn test_close_cancels_jobs() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let scheduler = TransferScheduler::new(context.clone(), config(1)).unwrap();
            let waiting = Arc::new(Waiting {
                context: context.clone(),
                started: AtomicBool::new(false),
            });
            let active = scheduler.execute(waiting.clone()).unwrap();
            let queued = scheduler.execute(Arc::new(Idle)).unwrap();
            while !waiting.started.load(Ordering::Acquire) {
                context.sleep(Duration::from_millis(1)).await;
            }

            scheduler.close().await;
            assert!(matches!(active.await, Err(Error::Canceled)));
            assert!(matches!(queued.await, Err(Error::Canceled)));
            assert!(matches!(
                scheduler.execute(Arc::new(Idle)),
                Err(Error::Disposed)
            ));

            // Closing again is a no-op
            scheduler.close().await;
            assert!(context.encode().contains("scheduler_canceled_total 2"));
        });
    }

    #[test_traced]
    fn test_invalid_config() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let result = TransferScheduler::new(context, config(0));
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        });
    }

    #[test_traced]
    fn test_cache_without_blocks() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            // A single operation derives a cache smaller than one block
            let cfg = Config {
                parallel_operations: 1,
                block_size: 16 * 1024 * 1024,
                maximum_cache_size: None,
                ..Config::default()
            };
            let result = TransferScheduler::new(context, cfg);
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        });
    }

    #[test_traced]
    fn test_queued_gauge_balanced() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let scheduler = Arc::new(TransferScheduler::new(context.clone(), config(2)).unwrap());
            let mut submitters = Vec::new();
            for _ in 0..4 {
                let scheduler = scheduler.clone();
                submitters.push(context.clone().spawn(move |context| async move {
                    let mut completions = Vec::new();
                    for _ in 0..25 {
                        let job = Steps::new(
                            context.clone(),
                            1,
                            Arc::new(AtomicUsize::new(0)),
                            Arc::new(AtomicUsize::new(0)),
                        );
                        completions.push(scheduler.execute(job).unwrap());
                    }
                    join_all(completions).await
                }));
            }
            for submitter in submitters {
                for result in submitter.await.unwrap() {
                    result.unwrap();
                }
            }
            scheduler.close().await;
            assert!(matches!(
                scheduler.execute(Arc::new(Idle)),
                Err(Error::Disposed)
            ));

            let buffer = context.encode();
            assert!(buffer.contains("scheduler_queued 0"));
            assert!(buffer.contains("scheduler_completed_total 100"));
        });
    }

    #[test_traced]
    fn test_shared_components() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let scheduler = TransferScheduler::new(context, config(4)).unwrap();
            let cells = crate::config::MAX_BLOCK_SIZE / crate::config::MIN_BLOCK_SIZE;
            assert_eq!(scheduler.memory().pool().max_cells(), cells);
            let buffer = scheduler.memory().require_buffer().unwrap();
            assert_eq!(buffer.len(), crate::config::MIN_BLOCK_SIZE);
            assert_eq!(scheduler.pacer().total_scheduled_volume(), 0);
            scheduler.close().await;
        });
    }
}
