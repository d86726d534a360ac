//! Fixed-delay retry used by the download and upload stages. Cancellation
//! observed at any point — before an attempt, or while sleeping between
//! attempts — exits immediately without counting as a failed attempt.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{PipelineError, PipelineResult};

/// Calls `attempt(1..=max_attempts)` until it succeeds, returns a
/// terminal error, or the attempt budget is exhausted. A terminal error
/// (per [`PipelineError::is_terminal`]) short-circuits immediately and
/// is returned as-is; an exhausted budget returns the last transient
/// error, leaving the caller to decide how to wrap it (e.g. into
/// `DownloadExhausted`).
pub async fn retry_loop<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    cancellation: &CancellationToken,
    mut attempt: F,
) -> PipelineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let mut last_err = PipelineError::Cancelled;

    for attempt_number in 1..=max_attempts.max(1) {
        if cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match attempt(attempt_number).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => {
                debug!(attempt = attempt_number, max_attempts, %err, "attempt failed, will retry after delay");
                last_err = err;
                if attempt_number == max_attempts {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => return Err(PipelineError::Cancelled),
                }
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[tokio::test]
    async fn succeeds_without_retrying_once_ok() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: PipelineResult<i32> = retry_loop(5, Duration::from_millis(1), &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_error_short_circuits_without_retrying() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let job_id = Uuid::new_v4();
        let result: PipelineResult<()> = retry_loop(5, Duration::from_millis(1), &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(PipelineError::NotFound(job_id)) }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_on_persistent_transient_error() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let job_id = Uuid::new_v4();
        let result: PipelineResult<()> = retry_loop(3, Duration::from_millis(1), &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(PipelineError::ChecksumMismatch(job_id)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_first_attempt() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        token.cancel();
        let result: PipelineResult<()> = retry_loop(5, Duration::from_millis(1), &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
