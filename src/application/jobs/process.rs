use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{info, warn};

use super::{context::JobWorkerContext, payload::RenderJobPayload, queue::RetryPolicy};
use crate::{
    application::{
        error::RenderJobError,
        repos::{JobFailure, RepoError},
    },
    domain::{
        entities::{Artifact, JobRecord},
        types::JobState,
    },
};

const METRIC_JOBS_COMPLETED: &str = "cardsmith_render_jobs_completed_total";
const METRIC_JOBS_FAILED: &str = "cardsmith_render_jobs_failed_total";
const METRIC_JOBS_RETRIED: &str = "cardsmith_render_jobs_retried_total";

/// Run one claimed attempt of `job` and record its outcome.
///
/// Returns the state the job was left in. Errors are only returned when the
/// outcome itself could not be written to the store.
pub async fn process_render_job(
    ctx: &JobWorkerContext,
    job: &JobRecord,
    worker_id: &str,
) -> Result<JobState, RepoError> {
    let attempt = attempt_number(job);

    match run_attempt(ctx, job, attempt).await {
        Ok(artifact) => {
            ctx.repo.mark_completed(&job.id, worker_id, &artifact).await?;
            counter!(METRIC_JOBS_COMPLETED).increment(1);
            info!(
                target = "cardsmith::jobs::process",
                job_id = %job.id,
                attempt,
                state = %JobState::Completed,
                "Render job completed"
            );
            Ok(JobState::Completed)
        }
        Err(error) => record_failure(ctx, job, worker_id, attempt, &error).await,
    }
}

fn attempt_number(job: &JobRecord) -> u32 {
    u32::try_from(job.attempts).unwrap_or(0).max(1)
}

/// Record an attempt whose handler panicked as a retryable render failure.
pub(super) async fn record_panic(
    ctx: &JobWorkerContext,
    job: &JobRecord,
    worker_id: &str,
) -> Result<JobState, RepoError> {
    let error = RenderJobError::RenderFailed("job handler panicked".to_string());
    record_failure(ctx, job, worker_id, attempt_number(job), &error).await
}

async fn run_attempt(
    ctx: &JobWorkerContext,
    job: &JobRecord,
    attempt: u32,
) -> Result<Artifact, RenderJobError> {
    let payload: RenderJobPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| RenderJobError::InvalidTemplate(format!("malformed job payload: {err}")))?;

    let (png, staged) = match ctx.artifacts.staged(&job.id).await {
        Ok(Some(png)) => {
            info!(
                target = "cardsmith::jobs::process",
                job_id = %job.id,
                attempt,
                "Persisting staged render from a previous attempt"
            );
            (png, true)
        }
        Ok(None) => (render(ctx, &payload).await?, false),
        Err(err) => {
            warn!(
                target = "cardsmith::jobs::process",
                job_id = %job.id,
                error = %err,
                "Staged render unreadable; rendering again"
            );
            (render(ctx, &payload).await?, false)
        }
    };

    match ctx
        .artifacts
        .persist(&job.id, attempt, png.clone(), &payload.options)
        .await
    {
        Ok(artifact) => {
            if staged {
                ctx.artifacts.clear_staged(&job.id).await;
            }
            Ok(artifact)
        }
        Err(err) => {
            if !staged && let Err(stage_err) = ctx.artifacts.stage(&job.id, &png).await {
                warn!(
                    target = "cardsmith::jobs::process",
                    job_id = %job.id,
                    error = %stage_err,
                    "Failed to stage render for the next attempt"
                );
            }
            Err(RenderJobError::ArtifactPersistFailure(err.to_string()))
        }
    }
}

async fn render(ctx: &JobWorkerContext, payload: &RenderJobPayload) -> Result<Bytes, RenderJobError> {
    let template = ctx.templates.resolve(&payload.template).await?;
    let image = ctx.executor.render(&template, &payload.mapping).await?;
    Ok(image.png)
}

async fn record_failure(
    ctx: &JobWorkerContext,
    job: &JobRecord,
    worker_id: &str,
    attempt: u32,
    error: &RenderJobError,
) -> Result<JobState, RepoError> {
    let retry_at = if !error.is_fatal() && job.has_attempts_left() {
        let base = Duration::from_millis(u64::try_from(job.backoff_base_ms).unwrap_or(0));
        let delay = RetryPolicy::backoff_after(base, attempt);
        Some(OffsetDateTime::now_utc() + delay)
    } else {
        None
    };

    let state = ctx
        .repo
        .mark_failed(JobFailure {
            id: job.id.clone(),
            worker_id: worker_id.to_string(),
            error: error.reason(),
            retry_at,
        })
        .await?;

    if state == JobState::Delayed {
        counter!(METRIC_JOBS_RETRIED).increment(1);
    } else {
        counter!(METRIC_JOBS_FAILED).increment(1);
    }

    warn!(
        target = "cardsmith::jobs::process",
        job_id = %job.id,
        attempt,
        max_attempts = job.max_attempts,
        state = %state,
        error = %error.reason(),
        "Render job attempt failed"
    );

    Ok(state)
}
