//! Await the output of spawned tasks.

use crate::Error;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::error;

/// Handle to a spawned task.
///
/// Awaiting the handle yields the task's output, or [Error::Exited] if the task
/// panicked or was aborted.
pub struct Handle<T> {
    inner: ::tokio::task::JoinHandle<T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(inner: ::tokio::task::JoinHandle<T>) -> Self {
        Self { inner }
    }

    /// Abort the task.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Returns true if the task has finished.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|result| {
            result.map_err(|err| {
                if err.is_panic() {
                    error!(?err, "task panicked");
                }
                Error::Exited
            })
        })
    }
}
