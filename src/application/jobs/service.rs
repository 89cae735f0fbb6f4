use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;

use super::{
    payload::{RenderJobPayload, RenderOptions, TemplateRef},
    queue::{RetryPolicy, enqueue_job},
};
use crate::{
    application::{
        error::JobError,
        repos::{JobPage, JobQueryFilter, JobsRepo},
    },
    domain::{entities::JobRecord, template::Mapping, types::JobState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub state: JobState,
}

#[derive(Debug, Clone)]
pub struct JobListing {
    pub jobs: Vec<JobRecord>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

/// Caller-facing operations on render jobs.
#[derive(Clone)]
pub struct RenderJobService {
    repo: Arc<dyn JobsRepo>,
    policy: RetryPolicy,
}

impl RenderJobService {
    pub fn new(repo: Arc<dyn JobsRepo>, policy: RetryPolicy) -> Self {
        Self { repo, policy }
    }

    pub fn repo(&self) -> &Arc<dyn JobsRepo> {
        &self.repo
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn enqueue(
        &self,
        template: TemplateRef,
        mapping: Mapping,
        options: RenderOptions,
    ) -> Result<JobHandle, JobError> {
        if let TemplateRef::Path(path) = &template
            && path.trim().is_empty()
        {
            return Err(JobError::Invalid("template path is empty".to_string()));
        }

        let attempts = match options.attempts {
            Some(0) => return Err(JobError::Invalid("attempts must be at least 1".to_string())),
            Some(attempts) => attempts,
            None => self.policy.attempts,
        };
        let reference = template.describe();
        let payload = RenderJobPayload {
            template,
            mapping,
            options,
        };

        let id = enqueue_job(
            self.repo.as_ref(),
            &payload,
            None,
            attempts,
            self.policy.backoff_base,
        )
        .await?;

        info!(
            target = "cardsmith::jobs::service",
            job_id = %id,
            template = %reference,
            attempts,
            "Enqueued render job"
        );

        Ok(JobHandle {
            id,
            state: JobState::Waiting,
        })
    }

    pub async fn get_status(&self, id: &str) -> Result<JobRecord, JobError> {
        self.repo
            .find_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })
    }

    pub async fn retry(&self, id: &str) -> Result<JobRecord, JobError> {
        let job = self
            .repo
            .retry_job(id, OffsetDateTime::now_utc())
            .await
            .map_err(|err| JobError::from_repo(id, err))?;

        info!(
            target = "cardsmith::jobs::service",
            job_id = %id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "Requeued render job"
        );
        Ok(job)
    }

    /// Delete the job record. Artifacts already written stay where they are.
    pub async fn remove(&self, id: &str) -> Result<(), JobError> {
        self.repo
            .remove_job(id)
            .await
            .map_err(|err| JobError::from_repo(id, err))?;

        info!(
            target = "cardsmith::jobs::service",
            job_id = %id,
            "Removed render job"
        );
        Ok(())
    }

    pub async fn list(&self, page: Option<u32>, limit: Option<u32>) -> Result<JobListing, JobError> {
        let page = JobPage::new(page, limit);
        let filter = JobQueryFilter::default();
        let jobs = self.repo.list_jobs(&filter, page).await?;
        let total = self.repo.count_jobs(&filter).await?;

        Ok(JobListing {
            jobs,
            page: page.page,
            limit: page.limit,
            total,
        })
    }
}
