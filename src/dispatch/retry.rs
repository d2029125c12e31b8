//! Retry with exponential backoff

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::http::ClientError;

/// Retry policy for transient dispatch failures
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Backoff before the attempt following `attempt` (1-based), with up to 50% jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter_ms = capped.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails terminally or attempts run out
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 1;
        loop {
            debug!("{} attempt {}/{}", what, attempt, self.max_attempts);
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        what,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.delay(3);
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_transient_errors_use_all_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("call", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Timeout(1))
            })
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(1))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("call", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Status {
                    status: 404,
                    url: "http://x".to_string(),
                    body: String::new(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_error() {
        let calls = &AtomicU32::new(0);
        let value = fast()
            .retry("call", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ClientError::ConnectionRefused("x".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
