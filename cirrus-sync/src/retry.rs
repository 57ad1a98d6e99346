//! Bounded retry around single remote calls.

use crate::classify::{Classified, ErrorClassifier};
use cirrus_core::{AffectedItem, Operation, RemoteError, RetryConfig, SyncError};
use std::future::Future;

/// Why a remote call produced no value.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFailure {
    /// The classifier's verdict on a non-transient failure. May still be a
    /// success verdict (not-found during a delete).
    Verdict(Classified),
    /// Transient failures outlasted the retry budget.
    Exhausted { attempts: u32 },
}

impl RemoteFailure {
    /// Whether the caller should carry on as if the call succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, RemoteFailure::Verdict(v) if v.is_success())
    }

    pub fn into_error(self, operation: Operation) -> SyncError {
        match self {
            RemoteFailure::Verdict(verdict) => verdict.into_error(operation),
            RemoteFailure::Exhausted { attempts } => {
                SyncError::RetriesExhausted { operation, attempts }
            }
        }
    }
}

/// Run `call`, retrying transient failures with exponential backoff.
///
/// Every failure is classified once; anything other than a transient verdict
/// is returned to the caller on the spot.
pub async fn call_with_retry<T, F, Fut>(
    retry: &RetryConfig,
    classifier: &ErrorClassifier,
    operation: Operation,
    affected: &[AffectedItem],
    mut call: F,
) -> Result<T, RemoteFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match classifier.classify(Some(&err), operation, affected, true) {
            Classified::Transient { retry_after } => {
                if attempt >= retry.max_retries {
                    tracing::warn!(
                        operation = %operation,
                        attempts = attempt + 1,
                        error = %err,
                        "Giving up after transient failures"
                    );
                    return Err(RemoteFailure::Exhausted {
                        attempts: attempt + 1,
                    });
                }
                let delay = retry_after.unwrap_or_else(|| retry.backoff_for(attempt));
                tracing::debug!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            verdict => return Err(RemoteFailure::Verdict(verdict)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::RemoteErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = call_with_retry(
            &fast_retry(3),
            &ErrorClassifier::new(),
            Operation::FetchRecords,
            &[],
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::new(RemoteErrorCode::NetworkFailure, "offline"))
                } else {
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = call_with_retry(
            &fast_retry(2),
            &ErrorClassifier::new(),
            Operation::FetchRecords,
            &[],
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::new(RemoteErrorCode::ZoneBusy, "busy"))
            },
        )
        .await;
        assert_eq!(result, Err(RemoteFailure::Exhausted { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_on_delete_is_a_success_verdict() {
        let result: Result<(), _> = call_with_retry(
            &fast_retry(2),
            &ErrorClassifier::new(),
            Operation::DeleteRecords,
            &[],
            || async { Err(RemoteError::new(RemoteErrorCode::UnknownItem, "gone")) },
        )
        .await;
        let failure = result.expect_err("call should report a verdict");
        assert!(failure.is_success());
    }
}
