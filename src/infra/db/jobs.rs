use std::{convert::TryFrom, time::Duration};

use async_trait::async_trait;
use sqlx::types::Json;
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

use super::{PostgresRepositories, map_sqlx_error};

const JOB_COLUMNS: &str = "id, payload, state, attempts, max_attempts, backoff_base_ms, run_at, \
    locked_by, locked_at, result, last_error, created_at, updated_at, finished_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    payload: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    backoff_base_ms: i64,
    run_at: OffsetDateTime,
    locked_by: Option<String>,
    locked_at: Option<OffsetDateTime>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    finished_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::try_from(row.state.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown job state `{}`", row.state))
        })?;

        let result = row
            .result
            .map(serde_json::from_value::<Artifact>)
            .transpose()
            .map_err(|err| {
                RepoError::from_persistence(format!("malformed artifact on job `{}`: {err}", row.id))
            })?;

        Ok(Self {
            id: row.id,
            payload: row.payload,
            state,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            backoff_base_ms: row.backoff_base_ms,
            run_at: row.run_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            result,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

impl PostgresRepositories {
    /// Distinguish "no such job" from "job is active" after a guarded write matched nothing.
    async fn explain_miss(&self, id: &str) -> RepoError {
        match sqlx::query_scalar::<_, String>("SELECT state FROM render_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
        {
            Ok(Some(state)) => RepoError::conflict(format!("job `{id}` is {state}")),
            Ok(None) => RepoError::NotFound,
            Err(err) => map_sqlx_error(err),
        }
    }
}

#[async_trait]
impl JobsRepo for PostgresRepositories {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO render_jobs (id, payload, state, max_attempts, backoff_base_ms, run_at)
            VALUES ($1, $2, 'waiting', $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&job.id)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.backoff_base_ms)
        .bind(job.run_at)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: OffsetDateTime,
        lease: Duration,
    ) -> Result<Option<JobRecord>, RepoError> {
        let stale_before = now - lease;

        sqlx::query(
            r#"
            UPDATE render_jobs
               SET state = 'failed',
                   last_error = $2,
                   locked_by = NULL,
                   locked_at = NULL,
                   finished_at = $3,
                   updated_at = $3
             WHERE state = 'active'
               AND locked_at < $1
               AND attempts >= max_attempts
            "#,
        )
        .bind(stale_before)
        .bind(LEASE_EXPIRED_REASON)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let sql = format!(
            r#"
            UPDATE render_jobs
               SET state = 'active',
                   attempts = attempts + 1,
                   locked_by = $1,
                   locked_at = $2,
                   updated_at = $2
             WHERE id = (
                   SELECT id
                     FROM render_jobs
                    WHERE (state IN ('waiting', 'delayed')
                           OR (state = 'active' AND locked_at < $3))
                      AND run_at <= $2
                    ORDER BY run_at, seq
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(stale_before)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        result: &Artifact,
    ) -> Result<(), RepoError> {
        let outcome = sqlx::query(
            r#"
            UPDATE render_jobs
               SET state = 'completed',
                   result = $3,
                   last_error = NULL,
                   locked_by = NULL,
                   locked_at = NULL,
                   finished_at = now(),
                   updated_at = now()
             WHERE id = $1
               AND state = 'active'
               AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(Json(result))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if outcome.rows_affected() == 0 {
            return Err(RepoError::conflict(format!(
                "job `{id}` is not held by worker `{worker_id}`"
            )));
        }
        Ok(())
    }

    async fn mark_failed(&self, failure: JobFailure) -> Result<JobState, RepoError> {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE render_jobs
               SET state = CASE WHEN $4::timestamptz IS NULL THEN 'failed' ELSE 'delayed' END,
                   run_at = COALESCE($4::timestamptz, run_at),
                   last_error = $3,
                   locked_by = NULL,
                   locked_at = NULL,
                   finished_at = CASE WHEN $4::timestamptz IS NULL THEN now() ELSE NULL END,
                   updated_at = now()
             WHERE id = $1
               AND state = 'active'
               AND locked_by = $2
            RETURNING state
            "#,
        )
        .bind(&failure.id)
        .bind(&failure.worker_id)
        .bind(&failure.error)
        .bind(failure.retry_at)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let Some(state) = state else {
            return Err(RepoError::conflict(format!(
                "job `{}` is not held by worker `{}`",
                failure.id, failure.worker_id
            )));
        };

        JobState::try_from(state.as_str())
            .map_err(|_| RepoError::from_persistence(format!("unknown job state `{state}`")))
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, RepoError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM render_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        filter: &JobQueryFilter,
        page: JobPage,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM render_jobs
             WHERE ($1::text IS NULL OR state = $1)
             ORDER BY created_at DESC, seq DESC
             LIMIT $2 OFFSET $3
            "#
        );
        let offset = i64::try_from(page.offset())
            .map_err(|_| RepoError::from_persistence("page offset exceeds supported range"))?;

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(filter.state.map(JobState::as_str))
            .bind(i64::from(page.limit))
            .bind(offset)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn count_jobs(&self, filter: &JobQueryFilter) -> Result<u64, RepoError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM render_jobs WHERE ($1::text IS NULL OR state = $1)",
        )
        .bind(filter.state.map(JobState::as_str))
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Self::convert_count(count)
    }

    async fn retry_job(&self, id: &str, now: OffsetDateTime) -> Result<JobRecord, RepoError> {
        let sql = format!(
            r#"
            UPDATE render_jobs
               SET state = 'waiting',
                   run_at = $2,
                   max_attempts = GREATEST(max_attempts, attempts + 1),
                   locked_by = NULL,
                   locked_at = NULL,
                   finished_at = NULL,
                   updated_at = $2
             WHERE id = $1
               AND state <> 'active'
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => JobRecord::try_from(row),
            None => Err(self.explain_miss(id).await),
        }
    }

    async fn remove_job(&self, id: &str) -> Result<(), RepoError> {
        let outcome = sqlx::query("DELETE FROM render_jobs WHERE id = $1 AND state <> 'active'")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if outcome.rows_affected() == 0 {
            return Err(self.explain_miss(id).await);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        PostgresRepositories::health_check(self)
            .await
            .map_err(map_sqlx_error)
    }

    async fn close(&self) {
        self.pool().close().await;
    }
}
