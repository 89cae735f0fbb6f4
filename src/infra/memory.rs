//! Single-process job store used when no database is configured.

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::repos::{
        JobFailure, JobPage, JobQueryFilter, JobsRepo, LEASE_EXPIRED_REASON, NewJobRecord,
        RepoError,
    },
    domain::{
        entities::{Artifact, JobRecord},
        types::JobState,
    },
};

#[derive(Default)]
struct MemoryState {
    /// Insertion order; ties on `run_at` are claimed oldest first.
    jobs: Vec<JobRecord>,
}

/// Keeps every job in one vector behind a single mutex, so each transition is atomic.
#[derive(Default)]
pub struct MemoryJobsRepo {
    state: Mutex<MemoryState>,
}

impl MemoryJobsRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn matches(filter: &JobQueryFilter, job: &JobRecord) -> bool {
    filter.state.is_none_or(|state| job.state == state)
}

fn lease_expired(job: &JobRecord, stale_before: OffsetDateTime) -> bool {
    job.state == JobState::Active && job.locked_at.is_some_and(|at| at < stale_before)
}

fn held_by<'a>(
    state: &'a mut MemoryState,
    id: &str,
    worker_id: &str,
) -> Result<&'a mut JobRecord, RepoError> {
    let job = state
        .jobs
        .iter_mut()
        .find(|job| job.id == id)
        .ok_or(RepoError::NotFound)?;
    if job.state != JobState::Active || job.locked_by.as_deref() != Some(worker_id) {
        return Err(RepoError::conflict(format!(
            "job `{id}` is not held by worker `{worker_id}`"
        )));
    }
    Ok(job)
}

#[async_trait]
impl JobsRepo for MemoryJobsRepo {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError> {
        let mut state = self.lock();
        if state.jobs.iter().any(|existing| existing.id == job.id) {
            return Err(RepoError::Duplicate {
                constraint: "render_jobs_pkey".to_string(),
            });
        }

        let now = OffsetDateTime::now_utc();
        let id = job.id.clone();
        state.jobs.push(JobRecord {
            id: job.id,
            payload: job.payload,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: job.max_attempts,
            backoff_base_ms: job.backoff_base_ms,
            run_at: job.run_at,
            locked_by: None,
            locked_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        });
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<JobRecord>, RepoError> {
        let stale_before = now - lease;
        let mut state = self.lock();
        for job in state.jobs.iter_mut() {
            if lease_expired(job, stale_before) && !job.has_attempts_left() {
                job.state = JobState::Failed;
                job.last_error = Some(LEASE_EXPIRED_REASON.to_string());
                job.locked_by = None;
                job.locked_at = None;
                job.finished_at = Some(now);
                job.updated_at = now;
            }
        }

        let next = state
            .jobs
            .iter_mut()
            .enumerate()
            .filter(|(_, job)| {
                (job.state.is_claimable() || lease_expired(job, stale_before)) && job.run_at <= now
            })
            .min_by_key(|(index, job)| (job.run_at, *index))
            .map(|(_, job)| job);

        let Some(job) = next else {
            return Ok(None);
        };

        job.state = JobState::Active;
        job.attempts += 1;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        result: &Artifact,
    ) -> Result<(), RepoError> {
        let mut state = self.lock();
        let job = held_by(&mut state, id, worker_id)?;
        let now = OffsetDateTime::now_utc();
        job.state = JobState::Completed;
        job.result = Some(result.clone());
        job.last_error = None;
        job.locked_by = None;
        job.locked_at = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, failure: JobFailure) -> Result<JobState, RepoError> {
        let mut state = self.lock();
        let job = held_by(&mut state, &failure.id, &failure.worker_id)?;
        let now = OffsetDateTime::now_utc();
        match failure.retry_at {
            Some(retry_at) => {
                job.state = JobState::Delayed;
                job.run_at = retry_at;
                job.finished_at = None;
            }
            None => {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
            }
        }
        job.last_error = Some(failure.error);
        job.locked_by = None;
        job.locked_at = None;
        job.updated_at = now;
        Ok(job.state)
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, RepoError> {
        Ok(self.lock().jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn list_jobs(
        &self,
        filter: &JobQueryFilter,
        page: JobPage,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let state = self.lock();
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);

        let mut jobs: Vec<(usize, &JobRecord)> = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| matches(filter, job))
            .collect();
        jobs.sort_by(|(a_index, a), (b_index, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b_index.cmp(a_index))
        });

        Ok(jobs
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn count_jobs(&self, filter: &JobQueryFilter) -> Result<u64, RepoError> {
        let count = self
            .lock()
            .jobs
            .iter()
            .filter(|job| matches(filter, job))
            .count();
        u64::try_from(count).map_err(|_| RepoError::from_persistence("count exceeds range"))
    }

    async fn retry_job(&self, id: &str, now: OffsetDateTime) -> Result<JobRecord, RepoError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(RepoError::NotFound)?;
        if job.state == JobState::Active {
            return Err(RepoError::conflict(format!("job `{id}` is active")));
        }

        job.state = JobState::Waiting;
        job.run_at = now;
        job.max_attempts = job.max_attempts.max(job.attempts + 1);
        job.locked_by = None;
        job.locked_at = None;
        job.finished_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn remove_job(&self, id: &str) -> Result<(), RepoError> {
        let mut state = self.lock();
        let index = state
            .jobs
            .iter()
            .position(|job| job.id == id)
            .ok_or(RepoError::NotFound)?;
        if state.jobs[index].state == JobState::Active {
            return Err(RepoError::conflict(format!("job `{id}` is active")));
        }
        state.jobs.remove(index);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    const LEASE: std::time::Duration = std::time::Duration::from_secs(300);

    fn new_job(id: &str, run_at: OffsetDateTime) -> NewJobRecord {
        NewJobRecord {
            id: id.to_string(),
            payload: serde_json::json!({ "template": "card.json" }),
            run_at,
            max_attempts: 2,
            backoff_base_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn claim_takes_due_jobs_in_order() {
        let repo = MemoryJobsRepo::new();
        let now = OffsetDateTime::now_utc();
        repo.enqueue_job(new_job("later", now + Duration::minutes(5)))
            .await
            .expect("enqueue");
        repo.enqueue_job(new_job("first", now)).await.expect("enqueue");
        repo.enqueue_job(new_job("second", now)).await.expect("enqueue");

        let first = repo.claim_next("w", now, LEASE).await.expect("claim").expect("job");
        assert_eq!(first.id, "first");
        assert_eq!(first.attempts, 1);
        assert_eq!(first.state, JobState::Active);

        let second = repo.claim_next("w", now, LEASE).await.expect("claim").expect("job");
        assert_eq!(second.id, "second");
        assert!(repo.claim_next("w", now, LEASE).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn stale_worker_cannot_complete() {
        let repo = MemoryJobsRepo::new();
        let now = OffsetDateTime::now_utc();
        repo.enqueue_job(new_job("job", now)).await.expect("enqueue");
        repo.claim_next("owner", now, LEASE).await.expect("claim");

        let artifact = Artifact::Local {
            path: "out/job-1.png".into(),
        };
        let err = repo
            .mark_completed("job", "intruder", &artifact)
            .await
            .expect_err("not the holder");
        assert!(matches!(err, RepoError::Conflict { .. }));
        repo.mark_completed("job", "owner", &artifact)
            .await
            .expect("holder completes");
    }

    #[tokio::test]
    async fn retry_of_exhausted_job_grants_one_more_attempt() {
        let repo = MemoryJobsRepo::new();
        let now = OffsetDateTime::now_utc();
        repo.enqueue_job(new_job("job", now)).await.expect("enqueue");
        for _ in 0..2 {
            repo.claim_next("w", now, LEASE).await.expect("claim").expect("job");
            repo.mark_failed(JobFailure {
                id: "job".into(),
                worker_id: "w".into(),
                error: "RenderFailed: blank".into(),
                retry_at: Some(now),
            })
            .await
            .expect("fail");
        }

        let retried = repo.retry_job("job", now).await.expect("retry");
        assert_eq!(retried.state, JobState::Waiting);
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.max_attempts, 3);
        assert_eq!(retried.last_error.as_deref(), Some("RenderFailed: blank"));
    }

    #[tokio::test]
    async fn active_jobs_cannot_be_retried_or_removed() {
        let repo = MemoryJobsRepo::new();
        let now = OffsetDateTime::now_utc();
        repo.enqueue_job(new_job("job", now)).await.expect("enqueue");
        repo.claim_next("w", now, LEASE).await.expect("claim");

        assert!(matches!(
            repo.retry_job("job", now).await,
            Err(RepoError::Conflict { .. })
        ));
        assert!(matches!(
            repo.remove_job("job").await,
            Err(RepoError::Conflict { .. })
        ));
        assert!(matches!(
            repo.remove_job("missing").await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_as_a_new_attempt() {
        let repo = MemoryJobsRepo::new();
        let now = OffsetDateTime::now_utc();
        repo.enqueue_job(new_job("job", now)).await.expect("enqueue");
        repo.claim_next("crashed", now, LEASE)
            .await
            .expect("claim")
            .expect("job");

        let within = now + Duration::seconds(299);
        assert!(repo.claim_next("w", within, LEASE).await.expect("claim").is_none());

        let after = now + Duration::seconds(301);
        let reclaimed = repo
            .claim_next("w", after, LEASE)
            .await
            .expect("claim")
            .expect("stale job");
        assert_eq!(reclaimed.id, "job");
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w"));

        let artifact = Artifact::Local {
            path: "out/job-1.png".into(),
        };
        assert!(matches!(
            repo.mark_completed("job", "crashed", &artifact).await,
            Err(RepoError::Conflict { .. })
        ));

        let later = after + Duration::seconds(301);
        assert!(repo.claim_next("w", later, LEASE).await.expect("claim").is_none());
        let job = repo.find_job("job").await.expect("find").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_REASON));
        assert!(job.locked_by.is_none());
    }
}
