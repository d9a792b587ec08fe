use super::types::RetryPolicy;
use crate::error::Result;

use std::future::Future;

/// Runs `op` until it succeeds.
///
/// With a zero attempt budget the first result is returned as is, so a
/// misconfigured peer surfaces its error to the caller. Otherwise failures are
/// retried with linear backoff and, once a round is exhausted, the loop sleeps
/// `sleep_timeout` and starts over.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if policy.max_retry_attempts == 0 {
        return op().await;
    }

    let mut rounds = 0u64;
    loop {
        for attempt in 1..=policy.max_retry_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 || rounds > 0 {
                        tracing::info!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::debug!(
                        "{} failed (attempt {}/{}): {}",
                        label,
                        attempt,
                        policy.max_retry_attempts,
                        e
                    );
                    if attempt < policy.max_retry_attempts {
                        tokio::time::sleep(policy.backoff(attempt)).await;
                    }
                }
            }
        }

        rounds += 1;
        tracing::warn!(
            "{} still failing after {} attempts, sleeping {:?} (round {})",
            label,
            policy.max_retry_attempts,
            policy.sleep_timeout(),
            rounds
        );
        tokio::time::sleep(policy.sleep_timeout()).await;
    }
}
