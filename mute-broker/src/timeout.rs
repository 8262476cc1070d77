//! Bounded waits for store round trips, platform calls and ack races

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum TimeoutOr<T> {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] T),
}

/// Runs a fallible future with an upper bound on how long it may take.
/// Elapsing yields `TimeoutOr::Timeout`,
/// an error from the future itself yields `TimeoutOr::Other`.
pub async fn timeout<F, S, E>(duration: Duration, future: F) -> Result<S, TimeoutOr<E>>
where
    F: Future<Output = Result<S, E>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(Ok(success)) => Ok(success),
        Ok(Err(err)) => Err(TimeoutOr::Other(err)),
        Err(_) => Err(TimeoutOr::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_future_reports_timeout() {
        let result: Result<(), TimeoutOr<std::io::Error>> =
            timeout(Duration::from_millis(10), futures::future::pending()).await;
        assert!(matches!(result, Err(TimeoutOr::Timeout(d)) if d == Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_inner_error_is_passed_through() {
        let result: Result<(), TimeoutOr<&str>> =
            timeout(Duration::from_secs(1), async { Err("boom") }).await;
        assert!(matches!(result, Err(TimeoutOr::Other("boom"))));
    }
}
