use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// Backoff and sizing parameters for a retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before a task is dead-lettered.
    pub max_retries: u32,
    /// Delay before the first retry; doubles with every failure.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_backoff: Duration,
    /// Adds a uniform `[0, 1)` second jitter to every delay.
    pub jitter: bool,
    /// Worker threads pulling due tasks.
    pub worker_count: usize,
    /// Maximum number of waiting tasks accepted by `add_task`.
    pub capacity: usize,
    /// Period of the queue-size stats log line.
    pub stats_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_backoff: Duration::from_secs(6 * 60 * 60),
            jitter: true,
            worker_count: 2,
            capacity: 1024,
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^retry_count, max_backoff)`, without jitter.
    pub fn base_backoff(&self, retry_count: u32) -> Duration {
        let factor = 2f64.powi(retry_count.min(63) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff)
    }

    /// The delay applied before the next attempt of a task that has already
    /// been retried `retry_count` times.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let delay = self.base_backoff(retry_count);
        if self.jitter {
            delay.saturating_add(Duration::from_secs_f64(rand::random::<f64>()))
        } else {
            delay
        }
    }
}

/// Runs `op` inline until it succeeds or `max_retries` attempts have failed.
///
/// Sleeps `min(base_delay * 2^i, 6h)` between attempts, where `i` is the
/// number of retries so far. Nothing is queued; the caller blocks for the
/// whole schedule and gets the last error back on exhaustion.
pub fn attempt_with_retry<T, E, F>(mut op: F, max_retries: u32, base_delay: Duration) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    let policy = RetryPolicy {
        max_retries: max_retries.max(1),
        base_delay,
        jitter: false,
        ..RetryPolicy::default()
    };

    let mut retry_count = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let delay = policy.base_backoff(retry_count);
                retry_count += 1;
                if retry_count >= policy.max_retries {
                    tracing::error!(retry_count, "Giving up after {} attempts: {}", retry_count, e);
                    return Err(e);
                }
                tracing::warn!(retry_count, "Attempt failed ({}); retrying in {:?}", e, delay);
                thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_base_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.base_backoff(0), Duration::from_secs(60));
        assert_eq!(p.base_backoff(1), Duration::from_secs(120));
        assert_eq!(p.base_backoff(2), Duration::from_secs(240));
        assert_eq!(p.base_backoff(3), Duration::from_secs(300));
        assert_eq!(p.base_backoff(40), Duration::from_secs(300));
        assert_eq!(p.base_backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_huge_delays_saturate() {
        let p = RetryPolicy {
            base_delay: Duration::MAX,
            max_backoff: Duration::MAX,
            jitter: true,
            ..policy()
        };
        assert_eq!(p.base_backoff(5), Duration::MAX);
        assert_eq!(p.backoff_delay(5), Duration::MAX);
    }

    #[test]
    fn test_jitter_stays_below_one_second() {
        let p = RetryPolicy { jitter: true, ..policy() };
        for retry_count in 0..5 {
            let extra = p.backoff_delay(retry_count) - p.base_backoff(retry_count);
            assert!(extra < Duration::from_secs(1));
        }
        assert_eq!(policy().backoff_delay(1), Duration::from_secs(120));
    }

    #[test]
    fn test_attempt_with_retry_recovers() {
        let mut calls = 0;
        let result: Result<&str, String> = attempt_with_retry(
            || {
                calls += 1;
                if calls < 3 { Err(format!("fail {}", calls)) } else { Ok("done") }
            },
            5,
            Duration::from_millis(1),
        );
        assert_eq!(result, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_attempt_with_retry_gives_up() {
        let mut calls = 0;
        let result: Result<(), String> = attempt_with_retry(
            || {
                calls += 1;
                Err(format!("fail {}", calls))
            },
            3,
            Duration::from_millis(1),
        );
        assert_eq!(result, Err("fail 3".to_string()));
        assert_eq!(calls, 3);
    }
}
