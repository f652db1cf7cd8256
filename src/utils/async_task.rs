use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Run `task` until it succeeds, bounding every attempt by
/// `policy.timeout_ms` and doubling the pause between attempts up to
/// `policy.max_delay_ms`. `max_retries == 0` retries forever.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let timeout_duration = Duration::from_millis(policy.timeout_ms);
    let max_delay = Duration::from_millis(policy.max_delay_ms);
    let mut delay = Duration::from_millis(policy.base_delay_ms);
    let mut attempts = 0;

    loop {
        let last_error = match timeout(timeout_duration, task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => {
                warn!(attempt = attempts + 1, "task failed with error: {:?}", e);
                e
            }
            Err(_) => {
                warn!(attempt = attempts + 1, "task timed out after {:?}", timeout_duration);
                Error::Timeout(timeout_duration)
            }
        };

        attempts += 1;
        if policy.max_retries != 0 && attempts >= policy.max_retries {
            warn!("task failed after {} attempts", attempts);
            return Err(Error::RetryTaskFailed(format!(
                "task failed after {attempts} attempts, last error: {last_error}"
            )));
        }

        sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// Exponential delay for `attempt` (0-based), capped at `max`, with up to 20%
/// random jitter so that many watchers do not reconnect in lockstep.
pub(crate) fn backoff_with_jitter(
    attempt: u32,
    base: Duration,
    max: Duration,
) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16)).min(max);
    let jitter_ms = (exp.as_millis() as u64) / 5;
    if jitter_ms == 0 {
        return exp;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
    (exp + Duration::from_millis(jitter)).min(max)
}

/// Spawn a named background task, logging its error if it stops with one
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    })
}
