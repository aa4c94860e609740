//! Timeout and retry around external provider calls

use crate::config::RetryPolicy;
use crate::error::EngineError;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

impl RetryPolicy {
    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

/// Run `op` under the policy's timeout, retrying transient failures.
///
/// Timeouts count as transient. Non-transient errors return immediately.
pub async fn call_with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::EmbeddingProvider(format!(
                "{} timed out after {:?}",
                label, policy.timeout
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(label, attempt, ?delay, error = %e, "Retrying provider call");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
