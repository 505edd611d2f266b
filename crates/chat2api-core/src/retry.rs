//! Bounded retry supervisor.

use std::time::Duration;

use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// Runs `attempt` up to `max_attempts` times, sleeping `delay` between
/// attempts.
///
/// Each attempt re-executes the whole pipeline unit from scratch, token
/// acquisition included, since the failure may be token-related. The last
/// error surfaces once the bound is reached; errors the taxonomy marks
/// non-retryable surface immediately. Retries stop at the stream boundary:
/// callers must not invoke this again once output has reached a consumer.
pub async fn run_with_retry<T, F, Fut>(
    mut attempt: F,
    max_attempts: u32,
    delay: Duration,
) -> CoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut last_error = None;
    for attempt_no in 0..max_attempts {
        if attempt_no > 0 {
            warn!(attempt_no, "retrying pipeline in {delay:?}");
            tokio::time::sleep(delay).await;
        }
        match attempt(attempt_no).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                warn!("pipeline attempt failed: {err}");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| CoreError::Protocol("retry bound is zero".to_string())))
}
