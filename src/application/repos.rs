//! Repository traits describing persistence adapters.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{Artifact, JobRecord};
use crate::domain::types::JobState;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;
/// Reason recorded when a job's lease ran out with no attempts left.
pub const LEASE_EXPIRED_REASON: &str = "RenderFailed: worker lease expired";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("conflicting state: {message}")]
    Conflict { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub id: String,
    pub payload: serde_json::Value,
    pub run_at: OffsetDateTime,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
}

/// Outcome of a failed attempt as decided by the orchestrator.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub id: String,
    pub worker_id: String,
    pub error: String,
    /// `Some` reschedules the job as `delayed`; `None` marks it terminally failed.
    pub retry_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct JobQueryFilter {
    pub state: Option<JobState>,
}

/// Zero-based offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPage {
    pub page: u32,
    pub limit: u32,
}

impl JobPage {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(0),
            limit: limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit)
    }
}

impl Default for JobPage {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Durable render-job queue.
///
/// Every state transition is a single atomic operation on the store. The
/// completion and failure calls only apply while the job is still `active`
/// and locked by the calling worker, so a job reclaimed elsewhere cannot be
/// overwritten by a stale worker.
#[async_trait]
pub trait JobsRepo: Send + Sync {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError>;

    /// Atomically move the next due `waiting`/`delayed` job to `active`,
    /// incrementing its attempt counter.
    ///
    /// An `active` job locked for longer than `lease` belongs to a worker that
    /// died; it is claimed again as a new attempt, or failed if it has no
    /// attempts left.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<JobRecord>, RepoError>;

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        result: &Artifact,
    ) -> Result<(), RepoError>;

    async fn mark_failed(&self, failure: JobFailure) -> Result<JobState, RepoError>;

    async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, RepoError>;

    async fn list_jobs(
        &self,
        filter: &JobQueryFilter,
        page: JobPage,
    ) -> Result<Vec<JobRecord>, RepoError>;

    async fn count_jobs(&self, filter: &JobQueryFilter) -> Result<u64, RepoError>;

    /// Returns `NotFound` for unknown ids and `Conflict` for active jobs.
    async fn retry_job(&self, id: &str, now: OffsetDateTime) -> Result<JobRecord, RepoError>;

    /// Returns `NotFound` for unknown ids and `Conflict` for active jobs.
    async fn remove_job(&self, id: &str) -> Result<(), RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(JobPage::new(None, None).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(JobPage::new(Some(2), Some(0)).limit, 1);
        assert_eq!(JobPage::new(Some(2), Some(5_000)).limit, MAX_PAGE_LIMIT);
        assert_eq!(JobPage::new(Some(3), Some(10)).offset(), 30);
    }
}
