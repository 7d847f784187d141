//! Retry controller wrapping node attempts with exponential backoff.

use crate::context::{ExecutionContext, LogLevel};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use weftcore::{ErrorKind, EventBus, ExecutionEvent, NodeError, NodeOutput, RetryPolicy};

/// Wait before attempt `n + 1`, given attempt `n` (1-based) just failed:
/// `min(initial * coefficient^(n-1), max)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let millis = policy.initial_interval_ms as f64 * policy.backoff_coefficient.powi(exponent);
    let capped = if millis.is_finite() {
        millis.min(policy.max_interval_ms as f64)
    } else {
        policy.max_interval_ms as f64
    };
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Whether a failure of this kind is worth another attempt under `policy`
pub fn is_retryable(policy: &RetryPolicy, kind: ErrorKind) -> bool {
    kind.is_transient() || (kind == ErrorKind::IsolationFault && policy.retry_isolation_faults)
}

/// Final outcome after all attempts
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<NodeOutput, NodeError>,
    pub attempts: u32,
}

pub struct RetryController {
    events: Arc<EventBus>,
}

impl RetryController {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    /// Run `attempt_fn` until it succeeds, fails with a non-retryable
    /// error, or the policy's attempts are used up. The closure receives
    /// the 1-based attempt number.
    pub async fn run<F, Fut>(
        &self,
        policy: &RetryPolicy,
        context: &ExecutionContext,
        node_id: &str,
        mut attempt_fn: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<NodeOutput, NodeError>>,
    {
        let max_attempts = policy.attempts();
        let cancellation = context.cancellation().clone();
        let mut attempt = 1;

        loop {
            let error = match attempt_fn(attempt).await {
                Ok(output) => {
                    return RetryOutcome {
                        result: Ok(output),
                        attempts: attempt,
                    }
                }
                Err(error) => error,
            };

            if attempt >= max_attempts || !is_retryable(policy, error.kind()) {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = backoff_delay(policy, attempt);
            tracing::warn!(
                run_id = %context.run_id(),
                node_id = %node_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "node attempt failed, retrying"
            );
            context
                .log(
                    LogLevel::Warn,
                    Some(node_id),
                    format!(
                        "attempt {} failed: {}; retrying in {}ms",
                        attempt,
                        error,
                        delay.as_millis()
                    ),
                )
                .await;
            self.events.emit(ExecutionEvent::NodeRetrying {
                run_id: context.run_id(),
                node_id: node_id.to_string(),
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
                timestamp: Utc::now(),
            });

            tokio::select! {
                _ = cancellation.cancelled() => {
                    return RetryOutcome {
                        result: Err(NodeError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
