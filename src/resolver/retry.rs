//! Retry schedule for endpoint resolution.
//!
//! Two schedules share one interval array: retryable failures (transport
//! errors and rejected 2xx bodies) sleep the base interval for their attempt,
//! rate limiting sleeps it scaled by `attempt + 1`.

use std::future::Future;
use std::time::Duration;

use crate::error::ResolverError;

/// Default base intervals between attempts.
pub const DEFAULT_INTERVALS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// One initial attempt plus one retry per interval.
    pub fn max_attempts(&self) -> usize {
        self.intervals.len() + 1
    }

    pub fn failure_delay(&self, attempt: usize) -> Option<Duration> {
        self.intervals.get(attempt).copied()
    }

    pub fn rate_limit_delay(&self, attempt: usize) -> Option<Duration> {
        let factor = u32::try_from(attempt + 1).unwrap_or(u32::MAX);
        self.intervals
            .get(attempt)
            .map(|base| base.saturating_mul(factor))
    }

}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVALS.to_vec())
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    RateLimited,
    Failed(ResolverError),
}

/// Drive `attempt` under `schedule`.
///
/// Retryable failures and rate limiting retry; any other failure returns at
/// once. When attempts run out, the most recent non-rate-limit error is
/// returned, or [`ResolverError::RateLimited`] if there was none.
pub async fn run_with_retry<T, F, Fut>(schedule: &RetrySchedule, mut attempt: F) -> Result<T, ResolverError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let max_attempts = schedule.max_attempts();
    let mut last_error = None;

    for index in 0..max_attempts {
        let delay = match attempt(index).await {
            AttemptOutcome::Success(value) => return Ok(value),
            AttemptOutcome::RateLimited => {
                tracing::warn!(attempt = index + 1, "Endpoint provider rate limited the request");
                schedule.rate_limit_delay(index)
            }
            AttemptOutcome::Failed(e) if e.is_retryable() => {
                tracing::warn!(attempt = index + 1, "Endpoint resolution attempt failed: {}", e);
                last_error = Some(e);
                schedule.failure_delay(index)
            }
            AttemptOutcome::Failed(e) => return Err(e),
        };

        if index + 1 < max_attempts
            && let Some(delay) = delay
        {
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_error.unwrap_or(ResolverError::RateLimited {
        attempts: max_attempts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn record_attempts() -> (Arc<Mutex<Vec<Duration>>>, Instant) {
        (Arc::new(Mutex::new(Vec::new())), Instant::now())
    }

    #[test]
    fn test_delays() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.max_attempts(), 4);
        assert_eq!(schedule.failure_delay(2), Some(Duration::from_secs(8)));
        assert_eq!(schedule.rate_limit_delay(0), Some(Duration::from_secs(2)));
        assert_eq!(schedule.rate_limit_delay(1), Some(Duration::from_secs(8)));
        assert_eq!(schedule.rate_limit_delay(2), Some(Duration::from_secs(24)));
        assert_eq!(schedule.rate_limit_delay(3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_every_time() {
        let (seen, start) = record_attempts();
        let schedule = RetrySchedule::default();

        let result: Result<(), _> = run_with_retry(&schedule, |_| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(start.elapsed());
                AttemptOutcome::RateLimited
            }
        })
        .await;

        assert!(matches!(result, Err(ResolverError::RateLimited { attempts: 4 })));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(34),
            ]
        );
        // No sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(34));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_use_base_intervals() {
        let (seen, start) = record_attempts();
        let schedule = RetrySchedule::default();

        let result = run_with_retry(&schedule, |index| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(start.elapsed());
                if index < 2 {
                    AttemptOutcome::Failed(ResolverError::Network("reset".to_string()))
                } else {
                    AttemptOutcome::Success("https://dest")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "https://dest");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(6),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_body_retries_on_base_interval() {
        let (seen, start) = record_attempts();
        let result = run_with_retry(&RetrySchedule::default(), |index| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(start.elapsed());
                if index == 0 {
                    AttemptOutcome::Failed(ResolverError::Parse("provider reported ok=false".to_string()))
                } else {
                    AttemptOutcome::Success("https://dest")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "https://dest");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Duration::from_secs(0), Duration::from_secs(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_stops_immediately() {
        let (seen, _) = record_attempts();
        let result: Result<(), _> = run_with_retry(&RetrySchedule::default(), |_| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(Duration::ZERO);
                AttemptOutcome::Failed(ResolverError::HttpStatus { status: 500 })
            }
        })
        .await;

        assert!(matches!(result, Err(ResolverError::HttpStatus { status: 500 })));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_transient_error() {
        let result: Result<(), _> = run_with_retry(&RetrySchedule::default(), |index| async move {
            if index == 1 {
                AttemptOutcome::Failed(ResolverError::Network("second".to_string()))
            } else {
                AttemptOutcome::RateLimited
            }
        })
        .await;

        match result {
            Err(ResolverError::Network(message)) => assert_eq!(message, "second"),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
