use crate::{
    storage::tokio::{Config as StorageConfig, Storage as TokioStorage},
    Error, Handle, Storage as _,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::OsRng, RngCore};
use std::{
    env,
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::runtime::{Builder, Handle as RuntimeHandle};

/// Configuration for the [Runner].
#[derive(Clone)]
pub struct Config {
    /// Number of worker threads used by the Tokio runtime.
    pub worker_threads: usize,

    /// Maximum number of threads used for blocking blob I/O.
    pub max_blocking_threads: usize,

    /// Directory holding every storage partition.
    pub storage_directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        // Generate a random directory name to avoid conflicts between runs
        let storage_directory =
            env::temp_dir().join(format!("courier_tokio_runtime_{}", OsRng.next_u64()));
        Self {
            worker_threads: 2,
            max_blocking_threads: 512,
            storage_directory,
        }
    }
}

struct Executor {
    handle: RuntimeHandle,
    registry: Mutex<Registry>,
}

/// Implementation of [crate::Runner] for the Tokio runtime.
pub struct Runner {
    cfg: Config,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Runner {
    /// Initialize a new Tokio runner with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

impl From<Config> for Runner {
    fn from(cfg: Config) -> Self {
        Self::new(cfg)
    }
}

impl crate::Runner for Runner {
    type Context = Context;

    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future,
    {
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.cfg.worker_threads)
            .max_blocking_threads(self.cfg.max_blocking_threads)
            .enable_all()
            .build()
            .expect("failed to create Tokio runtime");
        let executor = Arc::new(Executor {
            handle: runtime.handle().clone(),
            registry: Mutex::new(Registry::default()),
        });
        let context = Context {
            label: String::new(),
            executor,
            storage: TokioStorage::new(StorageConfig::new(self.cfg.storage_directory)),
        };
        runtime.block_on(f(context))
    }
}

/// Implementation of [crate::Spawner], [crate::Clock], [crate::Metrics], and
/// [crate::Storage] for the Tokio runtime.
#[derive(Clone)]
pub struct Context {
    label: String,
    executor: Arc<Executor>,
    storage: TokioStorage,
}

impl crate::Spawner for Context {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.executor.handle.clone();
        Handle::new(handle.spawn(f(self)))
    }
}

impl crate::Clock for Context {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }
}

impl crate::Metrics for Context {
    fn with_label(&self, label: &str) -> Self {
        assert!(
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "label must be non-empty and only contain alphanumeric characters and underscores: {label}"
        );
        let label = if self.label.is_empty() {
            label.to_string()
        } else {
            format!("{}_{}", self.label, label)
        };
        Self {
            label,
            ..self.clone()
        }
    }

    fn register<N: Into<String>, H: Into<String>>(
        &self,
        name: N,
        help: H,
        metric: impl prometheus_client::registry::Metric,
    ) {
        let name = name.into();
        let name = if self.label.is_empty() {
            name
        } else {
            format!("{}_{}", self.label, name)
        };
        self.executor
            .registry
            .lock()
            .unwrap()
            .register(name, help, metric);
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

impl crate::Storage for Context {
    type Blob = <TokioStorage as crate::Storage>::Blob;

    async fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), Error> {
        self.storage.open(partition, name).await
    }
}
