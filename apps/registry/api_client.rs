use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::warn;

/// Every outbound read is time-boxed at 15s.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum FetchError {
    /// Superseded by a newer request or the caller went away.
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out after retries")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("source not verified")]
    NotVerified,
}

impl FetchError {
    fn retryable(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Timeout)
    }
}

/// Cooperative cancellation handle for outbound reads. Dropping the
/// handle does not cancel; cancellation is an explicit signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires, for call sites without a canceller.
    pub fn never() -> Self {
        Self { receiver: None }
    }

    async fn cancelled(&mut self) {
        match &mut self.receiver {
            None => std::future::pending::<()>().await,
            Some(receiver) => {
                loop {
                    if *receiver.borrow() {
                        return;
                    }
                    if receiver.changed().await.is_err() {
                        // Handle dropped without cancelling; stay pending.
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelHandle { sender },
        CancelSignal {
            receiver: Some(receiver),
        },
    )
}

/// Runs `op` with the standard read policy: 15s timeout per attempt, up
/// to 2 retries with capped exponential backoff, no retry for
/// non-retryable classifications, cooperative cancellation throughout.
///
/// A cancelled request returns `Cancelled` and its result must never be
/// used to populate a cache.
pub async fn with_retries<T, F, Fut>(mut cancel: CancelSignal, op: F) -> Result<T, FetchError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = tokio::time::timeout(REQUEST_TIMEOUT, op(attempt)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(FetchError::Timeout),
                }
            }
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                let backoff =
                    Duration::from_millis(500 * 2u64.pow(attempt)).min(BACKOFF_CAP);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying fetch");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = AtomicU32::new(0);
        let result = with_retries(CancelSignal::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, FetchError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_network_errors_twice() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(CancelSignal::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Network("boom".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn invalid_input_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(CancelSignal::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::InvalidInput("bad address".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_verified_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retries(CancelSignal::never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::NotVerified) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::NotVerified)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_request() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let result: Result<u32, _> = with_retries(signal, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
