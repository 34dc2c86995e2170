//! Bounded polling with exponential backoff.

use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{EniError, Result};

/// Backoff schedule for a poll loop
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// First delay between attempts
    pub initial: Duration,
    /// Upper bound on a single delay
    pub max: Duration,
    /// Total time budget
    pub timeout: Duration,
}

impl Backoff {
    pub fn new(timeout: Duration) -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(4),
            timeout,
        }
    }

    /// Delay before the given attempt (1-based): 250ms, 500ms, 1s, ... capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Call `check` until it yields a value, the budget runs out, or it fails.
///
/// `check` returns `Ok(Some(v))` when the condition holds, `Ok(None)` to keep
/// waiting, or an error to stop immediately.
pub fn poll_until<T, F>(what: &str, backoff: Backoff, mut check: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut attempt = 1;

    loop {
        if let Some(value) = check()? {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= backoff.timeout {
            return Err(EniError::Timeout {
                what: what.to_string(),
                waited: elapsed,
            });
        }

        let delay = backoff.delay(attempt).min(backoff.timeout - elapsed);
        debug!(what, attempt, delay_ms = delay.as_millis() as u64, "Condition not met yet, backing off");
        thread::sleep(delay);
        attempt += 1;
    }
}

/// Retry `op` while it fails with an error accepted by `retry_if`, up to
/// `max_attempts` calls in total.
pub fn retry<T, F, R>(what: &str, max_attempts: u32, backoff: Backoff, retry_if: R, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
    R: Fn(&EniError) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && retry_if(&err) => {
                let delay = backoff.delay(attempt);
                debug!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "Retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(30));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(4));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(4));
    }

    #[test]
    fn test_poll_until_succeeds() {
        let mut calls = 0;
        let value = poll_until("third call", fast(), || {
            calls += 1;
            Ok(if calls == 3 { Some(calls) } else { None })
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_poll_until_times_out() {
        let err = poll_until::<(), _>("never", fast(), || Ok(None)).unwrap_err();
        assert!(matches!(err, EniError::Timeout { .. }));
        assert!(err.to_string().contains("never"));
    }

    #[test]
    fn test_retry_stops_on_other_errors() {
        let mut calls = 0;
        let err = retry::<(), _, _>(
            "op",
            5,
            fast(),
            |e| e.is_retryable(),
            |_| {
                calls += 1;
                Err(EniError::InvalidConfig("bad".to_string()))
            },
        )
        .unwrap_err();
        assert!(matches!(err, EniError::InvalidConfig(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_bounded() {
        let mut calls = 0;
        let result = retry(
            "op",
            3,
            fast(),
            |e| e.is_retryable(),
            |attempt| {
                calls += 1;
                if attempt < 3 {
                    Err(EniError::Timeout {
                        what: "x".to_string(),
                        waited: Duration::ZERO,
                    })
                } else {
                    Ok(attempt)
                }
            },
        )
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls, 3);
    }
}
