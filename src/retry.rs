//! Timeouts and bounded retries for infrastructure calls, built on
//! [`keen_retry`].
//!
//! Only errors that know they are transient get retried. Everything else is
//! reported immediately, so we never back off exponentially on something that
//! will never succeed.

use std::{fmt, time::Duration};

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use tokio::time;

use crate::{errors::FromTimeout, prelude::*};

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

/// Run `future`, reporting `E::from_timeout(limit)` if it takes too long.
pub async fn with_timeout<T, E>(
    limit: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, E>
where
    E: FromTimeout,
{
    match time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(E::from_timeout(limit)),
    }
}

/// Call `op` until it succeeds, fails with a non-transient error, or we run out
/// of retries. `what` is only used for logging.
pub async fn with_backoff<T, E, F, Fut>(what: &str, op: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsKnownTransient + fmt::Debug,
{
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 100..=10_000,
        re_attempts: 5,
        jitter_ratio: 0.2,
    };

    let resolved = attempt(op())
        .await
        .retry_with_async(|_| attempt(op()))
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "{what} succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "{what} FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });

    match resolved {
        ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp { fatal_error, .. }
        | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
    }
}

/// Run one attempt and sort the outcome for [`keen_retry`].
async fn attempt<T, E, Fut>(future: Fut) -> RetryResult<(), (), T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: IsKnownTransient + fmt::Debug,
{
    match future.await {
        Ok(output) => RetryResult::Ok {
            reported_input: (),
            output,
        },
        Err(error) if error.is_known_transient() => {
            debug!("Potentially transient error: {:?}", error);
            RetryResult::Transient { input: (), error }
        }
        Err(error) => RetryResult::Fatal { input: (), error },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::errors::StoreError;

    #[tokio::test]
    async fn test_recovers_from_transient_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = with_backoff("flaky call", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Unavailable("throttled".to_owned()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = with_backoff("doomed call", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Rejected("no such table".to_owned()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let result: Result<(), StoreError> =
            with_timeout(Duration::from_millis(10), async {
                time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
