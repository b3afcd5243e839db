use super::{metrics, Cancellation, Completion, Controller};
use crate::{memory::MemoryManager, pacer::Pacer, Config, Error};
use async_lock::{Mutex as AsyncMutex, Semaphore};
use courier_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    FutureExt,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, trace, warn};

/// A job submitted to the scheduler.
struct Job {
    /// The controller driving the job.
    controller: Arc<dyn Controller>,

    /// Resolved when the job completes, fails, or is canceled.
    completion: oneshot::Sender<Result<(), Error>>,
}

/// Outcome of one unit of work.
type Outcome = (u64, Result<bool, Error>);

/// Runs the work steps of many jobs across a bounded number of concurrent units.
///
/// Each job is an opaque [Controller]. The scheduler owns the [MemoryManager] and
/// [Pacer] shared by every job it runs.
pub struct TransferScheduler<E: Spawner + Clock + Metrics> {
    memory: MemoryManager<E>,
    pacer: Arc<Pacer>,
    metrics: metrics::Metrics,

    cancel: Cancellation,
    intake: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    dispatcher: AsyncMutex<Option<Handle<()>>>,
}

impl<E: Spawner + Clock + Metrics> TransferScheduler<E> {
    /// Create a scheduler and start its dispatch loop.
    pub fn new(context: E, cfg: Config) -> Result<Self, Error> {
        let budget = cfg.budget()?;
        let memory = MemoryManager::new(context.with_label("memory"), &cfg, budget);
        let pacer = Pacer::new(&cfg, budget.cache_size);
        let metrics = metrics::Metrics::init(context.with_label("scheduler"));
        let cancel = Cancellation::default();

        let (sender, receiver) = mpsc::unbounded();
        let dispatcher = Dispatcher {
            parallel_operations: cfg.parallel_operations,
            idle_interval: cfg.dispatch_idle_interval,
            cancel: cancel.clone(),
            intake: receiver,
            metrics: metrics.clone(),
        };
        let handle = context
            .with_label("dispatcher")
            .spawn(|context| dispatcher.run(context));
        debug!(
            parallel_operations = cfg.parallel_operations,
            block_size = cfg.block_size,
            cache_size = budget.cache_size,
            cells = budget.cells,
            "started scheduler"
        );

        Ok(Self {
            memory,
            pacer,
            metrics,
            cancel,
            intake: Mutex::new(Some(sender)),
            dispatcher: AsyncMutex::new(Some(handle)),
        })
    }

    /// The buffer manager shared by all jobs.
    pub fn memory(&self) -> &MemoryManager<E> {
        &self.memory
    }

    /// The pacer shared by all jobs.
    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    /// Submit a job.
    ///
    /// Fails with [Error::Disposed] once the scheduler has been closed.
    pub fn execute(&self, controller: Arc<dyn Controller>) -> Result<Completion, Error> {
        let intake = self.intake.lock().unwrap();
        let Some(sender) = intake.as_ref() else {
            return Err(Error::Disposed);
        };
        let (completion, receiver) = oneshot::channel();

        // Count the job before the dispatcher can take it
        self.metrics.queued.inc();
        if sender
            .unbounded_send(Job {
                controller,
                completion,
            })
            .is_err()
        {
            self.metrics.queued.dec();
            return Err(Error::Disposed);
        }
        Ok(Completion::new(receiver))
    }

    /// Stop accepting jobs, cancel the ones not yet finished, and wait for all
    /// in-flight work units to return.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        let Some(handle) = dispatcher.take() else {
            return;
        };
        self.intake.lock().unwrap().take();
        self.cancel.cancel();
        if let Err(err) = handle.await {
            warn!(?err, "dispatcher exited");
        }
        debug!("closed scheduler");
    }
}

impl<E: Spawner + Clock + Metrics> Drop for TransferScheduler<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A job that has been taken off the intake queue.
struct Active {
    controller: Arc<dyn Controller>,
    completion: oneshot::Sender<Result<(), Error>>,
}

/// State owned by the dispatch loop.
struct Dispatcher {
    parallel_operations: usize,
    idle_interval: Duration,
    cancel: Cancellation,
    intake: mpsc::UnboundedReceiver<Job>,
    metrics: metrics::Metrics,
}

impl Dispatcher {
    async fn run<E: Spawner + Clock>(mut self, context: E) {
        let permits = Arc::new(Semaphore::new(self.parallel_operations));
        let (outcome_sender, mut outcomes) = mpsc::unbounded::<Outcome>();
        let mut active: HashMap<u64, Active> = HashMap::new();
        let mut next_id = 0u64;
        let mut intake_closed = false;
        let mut rng = StdRng::from_entropy();

        loop {
            // Apply the outcomes of finished units
            while let Ok((id, result)) = outcomes.try_recv() {
                self.apply(&mut active, id, result);
            }
            if self.cancel.is_canceled() {
                break;
            }

            // Top up the active set
            while !intake_closed && active.len() < self.parallel_operations {
                match self.intake.try_recv() {
                    Ok(job) => {
                        trace!(id = next_id, "activated job");
                        active.insert(
                            next_id,
                            Active {
                                controller: job.controller,
                                completion: job.completion,
                            },
                        );
                        next_id += 1;
                        self.metrics.queued.dec();
                    }
                    Err(err) if err.is_closed() => intake_closed = true,
                    Err(_) => break,
                }
            }
            self.metrics.active.set(active.len() as i64);

            // Pick a job with work available
            let ready: Vec<u64> = active
                .iter()
                .filter(|(_, job)| job.controller.has_work() && !job.controller.is_finished())
                .map(|(id, _)| *id)
                .collect();
            let Some(&id) = ready.choose(&mut rng) else {
                if intake_closed && active.is_empty() {
                    break;
                }
                context.sleep(self.idle_interval).await;
                continue;
            };

            // Wait for a free unit
            let permit = permits.acquire_arc().await;
            if self.cancel.is_canceled() {
                break;
            }

            // Start one step of the job
            let controller = active[&id].controller.clone();
            let cancel = self.cancel.clone();
            let work = match panic::catch_unwind(AssertUnwindSafe(|| controller.do_work(cancel))) {
                Ok(work) => work,
                Err(payload) => {
                    drop(permit);
                    self.apply(&mut active, id, Err(panicked(payload)));
                    continue;
                }
            };
            self.metrics.dispatched.inc();
            let outcomes = outcome_sender.clone();
            context.clone().spawn(move |_| async move {
                let result = AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(panicked(payload)));
                drop(permit);
                let _ = outcomes.unbounded_send((id, result));
            });
        }

        // Resolve everything that did not finish
        for (_, job) in active.drain() {
            self.metrics.canceled.inc();
            let _ = job.completion.send(Err(Error::Canceled));
        }
        self.intake.close();
        while let Ok(job) = self.intake.try_recv() {
            self.metrics.queued.dec();
            self.metrics.canceled.inc();
            let _ = job.completion.send(Err(Error::Canceled));
        }
        self.metrics.active.set(0);

        // Wait for in-flight units to return their permits
        let mut held = Vec::with_capacity(self.parallel_operations);
        for _ in 0..self.parallel_operations {
            held.push(permits.acquire().await);
        }
        debug!(jobs = next_id, "dispatcher stopped");
    }

    /// Apply the outcome of one unit of work to its job.
    fn apply(&self, active: &mut HashMap<u64, Active>, id: u64, result: Result<bool, Error>) {
        if matches!(result, Ok(false)) {
            return;
        }

        // Another unit of the same job may have already resolved it
        let Some(job) = active.remove(&id) else {
            return;
        };
        let completion = match result {
            Ok(_) => {
                self.metrics.completed.inc();
                Ok(())
            }
            Err(Error::Canceled) => {
                self.metrics.canceled.inc();
                Err(Error::Canceled)
            }
            Err(err) => {
                self.metrics.failed.inc();
                warn!(id, ?err, "job failed");
                Err(match err {
                    Error::Uncategorized(msg) => Error::Uncategorized(msg),
                    err => Error::Uncategorized(err.to_string()),
                })
            }
        };
        trace!(id, "resolved job");
        let _ = job.completion.send(completion);
        self.metrics.active.set(active.len() as i64);
    }
}

/// Convert a panic payload into a failure.
fn panicked(payload: Box<dyn Any + Send>) -> Error {
    let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "work step panicked".to_string()
    };
    Error::Uncategorized(msg)
}
