use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use crate::{
    application::repos::{JobsRepo, NewJobRecord, RepoError},
    domain::{entities::JobRecord, types::JobState},
};

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Attempt budget and exponential backoff applied to every render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next run after attempt number `attempt` (1-based) failed.
    pub fn backoff_after(base: Duration, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        base.saturating_mul(1u32 << exponent)
    }
}

/// Enqueue a job with the provided payload, returning the assigned id.
pub async fn enqueue_job<J, P>(
    repo: &J,
    payload: &P,
    run_at: Option<OffsetDateTime>,
    max_attempts: u32,
    backoff_base: Duration,
) -> Result<String, RepoError>
where
    J: JobsRepo + ?Sized,
    P: serde::Serialize,
{
    let payload = serde_json::to_value(payload)
        .map_err(|err| RepoError::from_persistence(err.to_string()))?;
    let max_attempts = i32::try_from(max_attempts.max(1)).map_err(|_| RepoError::InvalidInput {
        message: "attempts exceeds supported range".to_string(),
    })?;
    let backoff_base_ms = i64::try_from(backoff_base.as_millis()).map_err(|_| {
        RepoError::InvalidInput {
            message: "backoff exceeds supported range".to_string(),
        }
    })?;
    let record = NewJobRecord {
        id: Uuid::new_v4().to_string(),
        payload,
        run_at: run_at.unwrap_or_else(OffsetDateTime::now_utc),
        max_attempts,
        backoff_base_ms,
    };

    repo.enqueue_job(record).await
}

/// Block until the job finishes or the timeout elapses, returning the final job snapshot.
pub async fn wait_for_job_completion<J>(
    repo: &J,
    job_id: &str,
    timeout: Duration,
) -> Result<JobRecord, RepoError>
where
    J: JobsRepo + ?Sized,
{
    let deadline = Instant::now() + timeout;

    loop {
        let job = repo.find_job(job_id).await?.ok_or(RepoError::NotFound)?;

        match job.state {
            JobState::Completed => return Ok(job),
            JobState::Failed => {
                let message = job
                    .last_error
                    .unwrap_or_else(|| "job failed without error text".to_string());
                return Err(RepoError::from_persistence(message));
            }
            _ => {
                if Instant::now() >= deadline {
                    return Err(RepoError::Timeout);
                }

                sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(1_000);
        assert_eq!(RetryPolicy::backoff_after(base, 1), Duration::from_millis(1_000));
        assert_eq!(RetryPolicy::backoff_after(base, 2), Duration::from_millis(2_000));
        assert_eq!(RetryPolicy::backoff_after(base, 3), Duration::from_millis(4_000));
        assert_eq!(RetryPolicy::backoff_after(base, 0), Duration::from_millis(1_000));
    }
}
