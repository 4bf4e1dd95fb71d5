//! Bounded retry with exponential backoff, driven by an error classifier.

use crate::cancel::CancelSignal;
use crate::config::RetryPolicy;
use crate::error::CanaryError;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Run `op` until it succeeds, fails with an error `classify` rejects, or the
/// attempt budget runs out. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    label: &str,
    classify: C,
    mut op: F,
) -> Result<T, CanaryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CanaryError>>,
    C: Fn(&CanaryError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match cancel.guard(op(attempt)).await {
            Ok(value) => return Ok(value),
            Err(CanaryError::Cancelled) => {
                info!(operation = label, attempt, "operation cancelled");
                return Err(CanaryError::Cancelled);
            }
            Err(err) if attempt < max_attempts && classify(&err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                cancel.guard(async {
                    tokio::time::sleep(delay).await;
                    Ok::<(), CanaryError>(())
                })
                .await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`retry_with_backoff`] retrying only transient failures.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    label: &str,
    op: F,
) -> Result<T, CanaryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CanaryError>>,
{
    retry_with_backoff(policy, cancel, label, CanaryError::is_retryable, op).await
}

/// Bound a collaborator call; running out of time is transient.
pub async fn with_deadline<T, Fut>(limit: Duration, label: &str, fut: Fut) -> Result<T, CanaryError>
where
    Fut: Future<Output = Result<T, CanaryError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CanaryError::Transient(format!(
            "{} timed out after {}ms",
            label,
            limit.as_millis()
        ))),
    }
}
