//! Run transfers on a multi-threaded [Tokio](https://tokio.rs) runtime, persisting blobs
//! as files under a storage directory (one subdirectory per partition).
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::{tokio, Blob, Metrics, Runner, Spawner, Storage};
//!
//! let executor = tokio::Runner::default();
//! let len = executor.start(|context| async move {
//!     let handle = context.with_label("writer").spawn(|context| async move {
//!         let (blob, _) = context.open("checkpoints", b"job").await.unwrap();
//!         blob.write_at(b"resume".to_vec(), 0).await.unwrap();
//!         blob.sync().await.unwrap();
//!         blob.len().await.unwrap()
//!     });
//!     handle.await.unwrap()
//! });
//! assert_eq!(len, 6);
//! ```

mod runner;
pub use runner::{Config, Context, Runner};
