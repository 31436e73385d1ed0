//! Exponential backoff for transport calls

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{MailError, Result};

/// Retry schedule: `base * 2^(attempt-1)`, capped, for at most `max_attempts`
/// tries in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient [`MailError::Transport`] errors are retried. The last
    /// error is returned when giving up.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        "{} failed ({}), retrying in {:?}", what, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(attempt, "{} giving up: {}", what, e);
                    return Err(give_up(e, attempt));
                }
            }
        }
    }
}

fn give_up(err: MailError, attempts: u32) -> MailError {
    match err {
        MailError::Transport { message, transient } if transient => MailError::Transport {
            message: format!("{} (after {} attempts)", message, attempts),
            transient,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        assert_eq!(RetryPolicy::default().delay_for(200), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_transient_until_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .retry("send", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MailError::transient("connection reset")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .retry("send", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MailError::permanent("535 authentication failed")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let result = fast()
            .retry("send", |attempt| async move {
                if attempt < 3 {
                    Err(MailError::transient("busy"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }
}
