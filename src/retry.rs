use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Exponential backoff for calls that report a rate limit.
///
/// Only [`AppError::RateLimited`] is retried; every other error is returned
/// on the first attempt. Once `max_attempts` rate-limited attempts have been
/// made the call fails with [`AppError::MaxRetriesExceeded`].
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self::with_rng(max_attempts, base_delay, StdRng::from_entropy())
    }

    pub fn with_rng(max_attempts: u32, base_delay: Duration, rng: StdRng) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter_rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_max_attempts,
            Duration::from_millis(config.rate_limit_base_delay_ms),
        )
    }

    pub async fn run<T, F, Fut>(&self, service: &'static str, mut call: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(AppError::RateLimited { retry_after, .. }) => {
                    if attempt >= self.max_attempts {
                        return Err(AppError::MaxRetriesExceeded {
                            service,
                            attempts: attempt,
                        });
                    }
                    let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
                    warn!(
                        service,
                        attempt,
                        max_attempts = self.max_attempts,
                        "rate limited; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
        let base = self.base_delay * (1 << exponent);
        let jitter_ceiling = self.base_delay.as_millis() as u64;
        if jitter_ceiling == 0 {
            return base;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Maps an HTTP 429 to [`AppError::RateLimited`], honouring `Retry-After`
/// when it is given in seconds.
pub(crate) fn rate_limit_error(service: &'static str, response: &reqwest::Response) -> Option<AppError> {
    if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    Some(AppError::RateLimited {
        service,
        retry_after,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::with_rng(max_attempts, Duration::ZERO, StdRng::seed_from_u64(7))
    }

    fn rate_limited() -> AppError {
        AppError::RateLimited {
            service: "test",
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy(5)
            .run("test", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(rate_limited())
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_ceiling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy(3)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(rate_limited())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::MaxRetriesExceeded {
                service: "test",
                attempts: 3
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy(5)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::Parse("bad body".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let policy = RetryPolicy::with_rng(10, Duration::from_millis(100), StdRng::seed_from_u64(1));
        let first = policy.backoff_delay(1);
        let third = policy.backoff_delay(3);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
    }
}
