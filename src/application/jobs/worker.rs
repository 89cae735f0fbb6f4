//! Claim loop that drains the render queue.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinSet, time::Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    context::JobWorkerContext,
    process::{process_render_job, record_panic},
};
use crate::{
    application::repos::RepoError,
    domain::{entities::JobRecord, types::JobState},
};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub max_jobs: Option<u64>,
    pub idle_timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// How long another worker's claim is honoured before the job is reclaimed.
    pub lease: Duration,
    pub worker_id: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_jobs: None,
            idle_timeout: None,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    MaxJobs,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Attempts whose outcome could not be recorded, or whose handler panicked.
    pub errors: u64,
    pub stop_reason: StopReason,
}

/// Liveness counters shared with the health endpoint.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    started: AtomicBool,
    processed: AtomicU64,
    in_flight: AtomicU64,
    last_activity: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealthSnapshot {
    pub started: bool,
    pub processed: u64,
    pub in_flight: u64,
    /// Unix seconds of the last claim or finished job; 0 before any activity.
    pub last_activity: i64,
}

impl WorkerHealth {
    pub fn snapshot(&self) -> WorkerHealthSnapshot {
        WorkerHealthSnapshot {
            started: self.started.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::Relaxed);
    }

    fn claimed(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }
}

type TaskOutcome = (JobRecord, std::thread::Result<Result<JobState, RepoError>>);

pub struct Worker {
    ctx: JobWorkerContext,
    options: WorkerOptions,
    health: Arc<WorkerHealth>,
}

impl Worker {
    pub fn new(ctx: JobWorkerContext, options: WorkerOptions) -> Self {
        let options = WorkerOptions {
            concurrency: options.concurrency.max(1),
            poll_interval: options.poll_interval.max(Duration::from_millis(1)),
            ..options
        };
        Self {
            ctx,
            options,
            health: Arc::new(WorkerHealth::default()),
        }
    }

    pub fn health(&self) -> Arc<WorkerHealth> {
        Arc::clone(&self.health)
    }

    /// Process jobs until shutdown is signalled, `max_jobs` claims were made,
    /// or the worker stayed idle for `idle_timeout`. In-flight jobs always
    /// finish before the engine pool and the store are closed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut report = WorkerReport {
            claimed: 0,
            completed: 0,
            retried: 0,
            failed: 0,
            errors: 0,
            stop_reason: StopReason::Shutdown,
        };
        let mut last_activity = Instant::now();
        self.health.started.store(true, Ordering::Relaxed);

        info!(
            target = "cardsmith::jobs::worker",
            worker_id = %self.options.worker_id,
            concurrency = self.options.concurrency,
            max_jobs = ?self.options.max_jobs,
            idle_timeout = ?self.options.idle_timeout,
            "Worker started"
        );

        report.stop_reason = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }

            while let Some(joined) = tasks.try_join_next() {
                self.record(joined, &mut report).await;
                last_activity = Instant::now();
            }

            if self
                .options
                .max_jobs
                .is_some_and(|max_jobs| report.claimed >= max_jobs)
            {
                break StopReason::MaxJobs;
            }

            if tasks.is_empty()
                && let Some(idle_timeout) = self.options.idle_timeout
                && last_activity.elapsed() >= idle_timeout
            {
                break StopReason::IdleTimeout;
            }

            if tasks.len() < self.options.concurrency {
                match self
                    .ctx
                    .repo
                    .claim_next(
                        &self.options.worker_id,
                        OffsetDateTime::now_utc(),
                        self.options.lease,
                    )
                    .await
                {
                    Ok(Some(job)) => {
                        report.claimed += 1;
                        last_activity = Instant::now();
                        self.spawn(&mut tasks, job);
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            target = "cardsmith::jobs::worker",
                            worker_id = %self.options.worker_id,
                            error = %err,
                            "Failed to claim next job"
                        );
                    }
                }
            }

            let wait = match self.options.idle_timeout {
                Some(idle_timeout) if tasks.is_empty() => self
                    .options
                    .poll_interval
                    .min(idle_timeout.saturating_sub(last_activity.elapsed()))
                    .max(Duration::from_millis(1)),
                _ => self.options.poll_interval,
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break StopReason::Shutdown;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.record(joined, &mut report).await;
                    last_activity = Instant::now();
                }
                _ = tokio::time::sleep(wait) => {}
            }
        };

        info!(
            target = "cardsmith::jobs::worker",
            worker_id = %self.options.worker_id,
            reason = ?report.stop_reason,
            in_flight = tasks.len(),
            "Worker stopping; draining in-flight jobs"
        );

        while let Some(joined) = tasks.join_next().await {
            self.record(joined, &mut report).await;
        }

        self.ctx.executor.pool().shutdown().await;
        self.ctx.repo.close().await;

        info!(
            target = "cardsmith::jobs::worker",
            worker_id = %self.options.worker_id,
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            errors = report.errors,
            "Worker stopped"
        );

        report
    }

    fn spawn(&self, tasks: &mut JoinSet<TaskOutcome>, job: JobRecord) {
        self.health.claimed();
        info!(
            target = "cardsmith::jobs::worker",
            job_id = %job.id,
            attempt = job.attempts,
            state = %JobState::Active,
            "Claimed render job"
        );

        let ctx = self.ctx.clone();
        let worker_id = self.options.worker_id.clone();
        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(process_render_job(&ctx, &job, &worker_id))
                .catch_unwind()
                .await;
            (job, outcome)
        });
    }

    async fn record(
        &self,
        joined: Result<TaskOutcome, tokio::task::JoinError>,
        report: &mut WorkerReport,
    ) {
        self.health.finished();

        let (job, outcome) = match joined {
            Ok(done) => done,
            Err(err) => {
                report.errors += 1;
                error!(
                    target = "cardsmith::jobs::worker",
                    error = %err,
                    "Job task ended abnormally"
                );
                return;
            }
        };

        match outcome {
            Ok(Ok(JobState::Completed)) => report.completed += 1,
            Ok(Ok(JobState::Delayed)) => report.retried += 1,
            Ok(Ok(_)) => report.failed += 1,
            Ok(Err(err)) => {
                report.errors += 1;
                error!(
                    target = "cardsmith::jobs::worker",
                    job_id = %job.id,
                    error = %err,
                    "Failed to record job outcome"
                );
            }
            Err(_) => {
                report.errors += 1;
                error!(
                    target = "cardsmith::jobs::worker",
                    job_id = %job.id,
                    "Job handler panicked"
                );
                if let Err(err) = record_panic(&self.ctx, &job, &self.options.worker_id).await {
                    warn!(
                        target = "cardsmith::jobs::worker",
                        job_id = %job.id,
                        error = %err,
                        "Failed to mark panicked job as failed"
                    );
                }
            }
        }
    }
}
