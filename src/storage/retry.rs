//! Exponential backoff for transient store failures.

use std::time::Duration;

use rand::Rng;
use tokio::runtime::RuntimeFlavor;
use tracing::warn;

use super::{StoreError, StoreResult};
use crate::config::StorageConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }

    /// Retry immediately; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

/// Run `op`, retrying only [`StoreError::Unavailable`] failures.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(StoreError::Unavailable(reason)) if attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "store unavailable, retrying"
                );
                backoff(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Sleep for `delay` without stalling other tasks on a multi-threaded
/// tokio runtime.
fn backoff(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(delay));
        }
        _ => std::thread::sleep(delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Instant;

    #[test]
    fn test_retries_unavailable_then_succeeds() {
        let calls = Cell::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "load_task", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Unavailable("locked".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = with_retry(&RetryPolicy::immediate(2), "load_task", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Unavailable("down".into()))
        });
        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = with_retry(&RetryPolicy::immediate(5), "load_task", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Invalid("bad".into()))
        });
        assert!(matches!(result, Err(StoreError::Invalid(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        let first = policy.delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let second = policy.delay(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        let capped = policy.delay(6);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(375));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_backoff_inside_runtime_lets_other_tasks_run() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(200),
        };
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Instant::now()
        });
        let retrying = tokio::spawn(async move {
            let calls = Cell::new(0);
            let result = with_retry(&policy, "load_task", || {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    Err(StoreError::Unavailable("locked".into()))
                } else {
                    Ok(())
                }
            });
            (result.is_ok(), Instant::now())
        });

        let (ok, finished) = retrying.await.unwrap();
        let ticked = ticker.await.unwrap();
        assert!(ok);
        assert!(ticked < finished);
    }
}
