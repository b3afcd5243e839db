//! Retry a fallible action with a fixed delay.

use crate::Error;
use std::{thread, time::Duration};
use tracing::debug;

/// Run `action` until it succeeds, at most `max_attempts` times, sleeping `interval`
/// between attempts.
///
/// `on_retry` observes every failure that will be retried along with the number of the
/// attempt that failed (starting at 1). If every attempt fails, the returned
/// [Error::Aggregate] holds each failure in order.
///
/// This blocks the calling thread while sleeping; do not call it from an async task.
pub fn execute_with_retry<T>(
    mut action: impl FnMut() -> Result<T, Error>,
    mut on_retry: impl FnMut(&Error, usize),
    interval: Duration,
    max_attempts: usize,
) -> Result<T, Error> {
    let mut failures = Vec::with_capacity(max_attempts);
    for attempt in 1..=max_attempts {
        match action() {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!(attempt, ?err, "attempt failed");
                if attempt < max_attempts {
                    on_retry(&err, attempt);
                    thread::sleep(interval);
                }
                failures.push(err);
            }
        }
    }
    Err(Error::Aggregate(failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_macros::test_traced;

    #[test_traced]
    fn test_succeeds_after_failures() {
        let mut calls = 0;
        let mut retries = Vec::new();
        let result = execute_with_retry(
            || {
                calls += 1;
                if calls < 3 {
                    return Err(Error::Stream(format!("failure {calls}")));
                }
                Ok(calls)
            },
            |_, attempt| retries.push(attempt),
            Duration::from_millis(1),
            5,
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[test_traced]
    fn test_aggregates_all_failures() {
        let mut retries = 0;
        let result: Result<(), _> = execute_with_retry(
            || Err(Error::Canceled),
            |_, _| retries += 1,
            Duration::ZERO,
            3,
        );
        let Err(Error::Aggregate(failures)) = result else {
            panic!("expected aggregate error");
        };
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|err| matches!(err, Error::Canceled)));
        assert_eq!(retries, 2);
    }

    #[test_traced]
    fn test_no_attempts() {
        let result: Result<(), _> =
            execute_with_retry(|| Ok(()), |_, _| {}, Duration::ZERO, 0);
        assert!(matches!(result, Err(Error::Aggregate(failures)) if failures.is_empty()));
    }
}
