//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

use zen_core::{Context, Result};

pub const DEFAULT_RETRIES: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_millis(100);
pub const MAX_DELAY: Duration = Duration::from_secs(5);
/// Each wait is drawn from `delay * (1 ± JITTER)`.
pub const JITTER: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base: BASE_DELAY,
            cap: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Doubling backoff from `base` up to `cap`. Attempts are bounded by
    /// `retries`, not by elapsed time.
    pub fn backoff(&self, jitter: f64) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_max_interval(self.cap)
            .with_multiplier(2.0)
            .with_randomization_factor(jitter)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut backoff = self.backoff(0.0);
        let mut wait = self.base;
        for _ in 0..attempt.clamp(1, 32) {
            wait = backoff.next_backoff().unwrap_or(self.cap);
        }
        wait
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out
/// of retries, or `ctx` is done. The last error is returned unchanged.
pub async fn retry<F, Fut, T>(ctx: &Context, policy: RetryPolicy, name: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff(JITTER);
    let mut attempt = 0;
    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        attempt += 1;
        match op(attempt).await {
            Ok(v) => {
                if attempt > 1 {
                    debug!(operation = name, attempts = attempt, "succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if !e.retryable => return Err(e),
            Err(e) if attempt > policy.retries => {
                warn!(operation = name, attempts = attempt, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let wait = backoff.next_backoff().unwrap_or(policy.cap);
                debug!(
                    operation = name,
                    attempt,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "retrying"
                );
                ctx.sleep(wait).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use zen_core::{ErrorCode, ZenError};

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(20), Duration::from_secs(5));
    }

    #[test]
    fn jittered_waits_stay_around_the_delay() {
        let p = RetryPolicy::default();
        let mut backoff = p.backoff(JITTER);
        for expected in [100u64, 200, 400] {
            let wait = backoff.next_backoff().unwrap();
            assert!(
                wait >= Duration::from_millis(expected / 2)
                    && wait <= Duration::from_millis(expected * 3 / 2),
                "{wait:?} outside {expected}ms ± 50%"
            );
        }
    }

    #[tokio::test]
    async fn non_retryable_is_called_once() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry(&Context::background(), fast(3), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ZenError::invalid_data("bad")) }
        })
        .await;
        assert!(res.unwrap_err().is(ErrorCode::InvalidData));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_then_success_is_called_twice() {
        let calls = AtomicU32::new(0);
        let res = retry(&Context::background(), fast(3), "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    Err(ZenError::new(ErrorCode::NetworkError, "reset"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_transient_is_called_retries_plus_one() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry(&Context::background(), fast(3), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ZenError::new(ErrorCode::NetworkError, "down")) }
        })
        .await;
        assert!(res.unwrap_err().is(ErrorCode::NetworkError));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stops_when_context_is_cancelled() {
        let ctx = Context::background();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            retries: 10,
            base: Duration::from_secs(10),
            cap: Duration::from_secs(10),
        };
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let res: Result<()> = retry(&ctx, policy, "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ZenError::timeout("slow")) }
        })
        .await;
        assert!(res.unwrap_err().is(ErrorCode::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
