use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::watch;

use cardsmith::application::artifacts::{ArtifactError, ArtifactStore, ObjectStore};
use cardsmith::application::compose::RenderDocument;
use cardsmith::application::error::JobError;
use cardsmith::application::jobs::{
    JobWorkerContext, RenderJobService, RenderOptions, RetryPolicy, StopReason, TemplateRef,
    TemplateResolver, Worker, WorkerOptions, WorkerReport,
};
use cardsmith::application::render::{
    Clip, Engine, EngineError, EngineLauncher, EnginePool, EngineSession, ExecutorConfig,
    PoolConfig, RenderExecutor, Viewport,
};
use cardsmith::application::repos::JobsRepo;
use cardsmith::domain::entities::{Artifact, PresignedUrl};
use cardsmith::domain::template::{Mapping, Template};
use cardsmith::domain::types::JobState;
use cardsmith::infra::engine::RasterLauncher;
use cardsmith::infra::memory::MemoryJobsRepo;

struct Harness {
    repo: Arc<MemoryJobsRepo>,
    service: RenderJobService,
    artifacts: Arc<ArtifactStore>,
    templates: Arc<TemplateResolver>,
    policy: RetryPolicy,
    _output: TempDir,
}

struct OfflineLauncher;

#[async_trait]
impl EngineLauncher for OfflineLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        Err(EngineError::unavailable("no browser installed"))
    }
}

/// Renders a fixed PNG and counts document loads.
struct CountingLauncher {
    loads: Arc<AtomicUsize>,
    panic_on_load: bool,
}

struct CountingEngine {
    loads: Arc<AtomicUsize>,
    panic_on_load: bool,
}

struct CountingSession {
    loads: Arc<AtomicUsize>,
    panic_on_load: bool,
}

impl CountingLauncher {
    fn new() -> Self {
        Self {
            loads: Arc::new(AtomicUsize::new(0)),
            panic_on_load: false,
        }
    }
}

#[async_trait]
impl EngineLauncher for CountingLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(CountingEngine {
            loads: self.loads.clone(),
            panic_on_load: self.panic_on_load,
        }))
    }
}

#[async_trait]
impl Engine for CountingEngine {
    async fn open_session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        Ok(Box::new(CountingSession {
            loads: self.loads.clone(),
            panic_on_load: self.panic_on_load,
        }))
    }

    async fn close(&self) {}
}

#[async_trait]
impl EngineSession for CountingSession {
    async fn set_viewport(&mut self, _viewport: Viewport) -> Result<(), EngineError> {
        Ok(())
    }

    async fn load(&mut self, _document: &RenderDocument) -> Result<(), EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_load {
            panic!("renderer crashed");
        }
        Ok(())
    }

    async fn capture(&mut self, _clip: Clip) -> Result<Bytes, EngineError> {
        Ok(Bytes::from(photo_png()))
    }

    async fn close(&mut self) {}
}

/// Object storage whose first `put` fails.
#[derive(Default)]
struct FlakyBucket {
    puts: AtomicUsize,
    stored: std::sync::Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl ObjectStore for FlakyBucket {
    async fn put(
        &self,
        _bucket: &str,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), ArtifactError> {
        if self.puts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ArtifactError::Upload("503 Slow Down".into()));
        }
        self.stored
            .lock()
            .expect("lock")
            .push((key.to_string(), bytes.len()));
        Ok(())
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ArtifactError> {
        Ok(PresignedUrl {
            url: format!("https://example.test/{bucket}/{key}"),
            expires_at: OffsetDateTime::UNIX_EPOCH + ttl,
        })
    }
}

impl Harness {
    fn new() -> Self {
        let output = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactStore::local(output.path());
        Self::with_artifacts(output, artifacts)
    }

    fn with_artifacts(output: TempDir, artifacts: ArtifactStore) -> Self {
        let repo = Arc::new(MemoryJobsRepo::new());
        let policy = RetryPolicy {
            attempts: 3,
            backoff_base: Duration::from_millis(10),
        };
        let templates_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");

        Self {
            service: RenderJobService::new(repo.clone(), policy),
            artifacts: Arc::new(artifacts),
            templates: Arc::new(TemplateResolver::new(templates_root)),
            repo,
            policy,
            _output: output,
        }
    }

    /// A worker owns its pool and closes it on exit, so every run gets a fresh one.
    fn worker(&self, launcher: Arc<dyn EngineLauncher>, options: WorkerOptions) -> Worker {
        let pool = EnginePool::new(
            launcher,
            PoolConfig {
                max_sessions: 2,
                acquire_timeout: Duration::from_secs(10),
            },
        );
        let executor = RenderExecutor::new(
            pool,
            ExecutorConfig {
                settle_delay: Duration::ZERO,
                load_timeout: Duration::from_secs(10),
                capture_timeout: Duration::from_secs(10),
                ..ExecutorConfig::default()
            },
        );
        let ctx = JobWorkerContext {
            repo: self.repo.clone(),
            executor,
            artifacts: self.artifacts.clone(),
            templates: self.templates.clone(),
            policy: self.policy,
        };
        Worker::new(ctx, options)
    }

    async fn drain(&self, launcher: Arc<dyn EngineLauncher>, jobs: u64) -> WorkerReport {
        let worker = self.worker(
            launcher,
            WorkerOptions {
                max_jobs: Some(jobs),
                poll_interval: Duration::from_millis(10),
                ..WorkerOptions::default()
            },
        );
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(30), worker.run(rx))
            .await
            .expect("worker finished")
    }
}

fn photo_png() -> Vec<u8> {
    let image = RgbaImage::from_pixel(8, 8, Rgba([200, 40, 40, 255]));
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .expect("encode png");
    png
}

fn photo_data_uri() -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(photo_png())
    )
}

fn unsized_template() -> TemplateRef {
    TemplateRef::Inline(Box::new(Template {
        template_id: Some("broken".to_string()),
        ..Template::default()
    }))
}

#[tokio::test]
async fn enqueued_card_renders_to_a_local_png() {
    let harness = Harness::new();
    let mut mapping = Mapping::new();
    mapping.insert("NAME".to_string(), "Ada".to_string());
    mapping.insert("PHOTO".to_string(), photo_data_uri());

    let handle = harness
        .service
        .enqueue(
            TemplateRef::Path("card.json".to_string()),
            mapping,
            RenderOptions::default(),
        )
        .await
        .expect("enqueued");
    assert_eq!(handle.state, JobState::Waiting);

    let report = harness.drain(Arc::new(RasterLauncher), 1).await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.stop_reason, StopReason::MaxJobs);

    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.finished_at.is_some());
    assert!(job.last_error.is_none());

    let Some(Artifact::Local { path }) = job.result else {
        panic!("expected a local artifact, got {:?}", job.result);
    };
    let bytes = tokio::fs::read(&path).await.expect("artifact readable");
    let decoded = image::load_from_memory(&bytes).expect("valid png");
    assert_eq!((decoded.width(), decoded.height()), (600, 840));
}

#[tokio::test]
async fn template_without_size_fails_without_retrying() {
    let harness = Harness::new();
    let handle = harness
        .service
        .enqueue(unsized_template(), Mapping::new(), RenderOptions::default())
        .await
        .expect("enqueued");

    let report = harness.drain(Arc::new(RasterLauncher), 1).await;
    assert_eq!(report.failed, 1);

    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.result.is_none());
    let reason = job.last_error.expect("failure reason");
    assert!(reason.starts_with("InvalidTemplate"), "reason was {reason}");
}

#[tokio::test]
async fn unavailable_engine_schedules_a_backoff() {
    let harness = Harness::new();
    let handle = harness
        .service
        .enqueue(
            TemplateRef::Path("card.json".to_string()),
            Mapping::new(),
            RenderOptions::default(),
        )
        .await
        .expect("enqueued");

    let before = OffsetDateTime::now_utc();
    let report = harness.drain(Arc::new(OfflineLauncher), 1).await;
    assert_eq!(report.retried, 1);

    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempts, 1);
    assert!(job.run_at > before);
    let reason = job.last_error.expect("failure reason");
    assert!(reason.starts_with("EngineUnavailable"), "reason was {reason}");
}

#[tokio::test]
async fn retry_reruns_the_same_job() {
    let harness = Harness::new();
    let handle = harness
        .service
        .enqueue(unsized_template(), Mapping::new(), RenderOptions::default())
        .await
        .expect("enqueued");
    harness.drain(Arc::new(RasterLauncher), 1).await;

    let retried = harness.service.retry(&handle.id).await.expect("retried");
    assert_eq!(retried.id, handle.id);
    assert_eq!(retried.state, JobState::Waiting);
    assert_eq!(retried.attempts, 1);

    harness.drain(Arc::new(RasterLauncher), 1).await;
    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.id, handle.id);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.state, JobState::Failed);
}

#[tokio::test]
async fn removed_jobs_are_gone_and_active_jobs_are_protected() {
    let harness = Harness::new();
    let queued = harness
        .service
        .enqueue(unsized_template(), Mapping::new(), RenderOptions::default())
        .await
        .expect("enqueued");

    harness.service.remove(&queued.id).await.expect("removed");
    let err = harness
        .service
        .get_status(&queued.id)
        .await
        .expect_err("gone");
    assert!(matches!(err, JobError::NotFound { .. }));

    let active = harness
        .service
        .enqueue(unsized_template(), Mapping::new(), RenderOptions::default())
        .await
        .expect("enqueued");
    harness
        .repo
        .claim_next(
            "test-worker",
            OffsetDateTime::now_utc(),
            Duration::from_secs(300),
        )
        .await
        .expect("claim")
        .expect("job is due");

    let err = harness.service.remove(&active.id).await.expect_err("active");
    assert!(matches!(err, JobError::Active { .. }));
    let err = harness.service.retry(&active.id).await.expect_err("active");
    assert!(matches!(err, JobError::Active { .. }));

    let err = harness
        .service
        .retry("00000000-0000-0000-0000-000000000000")
        .await
        .expect_err("unknown");
    assert!(matches!(err, JobError::NotFound { .. }));
}

#[tokio::test]
async fn listing_pages_through_jobs() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness
            .service
            .enqueue(unsized_template(), Mapping::new(), RenderOptions::default())
            .await
            .expect("enqueued");
    }

    let listing = harness.service.list(Some(0), Some(2)).await.expect("listed");
    assert_eq!(listing.total, 3);
    assert_eq!(listing.jobs.len(), 2);

    let listing = harness.service.list(Some(1), Some(2)).await.expect("listed");
    assert_eq!(listing.jobs.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_worker_exits_after_its_timeout() {
    let harness = Harness::new();
    let worker = harness.worker(
        Arc::new(RasterLauncher),
        WorkerOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            poll_interval: Duration::from_millis(200),
            ..WorkerOptions::default()
        },
    );
    let (_tx, rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let report = worker.run(rx).await;
    let elapsed = started.elapsed();

    assert_eq!(report.stop_reason, StopReason::IdleTimeout);
    assert_eq!(report.claimed, 0);
    assert!(elapsed >= Duration::from_secs(5), "stopped after {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(7), "stopped after {elapsed:?}");
}

#[tokio::test]
async fn failed_upload_is_retried_from_the_staged_render() {
    let output = tempfile::tempdir().expect("tempdir");
    let bucket = Arc::new(FlakyBucket::default());
    let artifacts =
        ArtifactStore::local(output.path()).with_object_store(bucket.clone(), "cards", "renders/");
    let harness = Harness::with_artifacts(output, artifacts);
    let handle = harness
        .service
        .enqueue(
            TemplateRef::Path("card.json".to_string()),
            Mapping::new(),
            RenderOptions::default(),
        )
        .await
        .expect("enqueued");
    let launcher = Arc::new(CountingLauncher::new());

    let report = harness.drain(launcher.clone(), 1).await;
    assert_eq!(report.retried, 1);
    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.state, JobState::Delayed);
    let reason = job.last_error.expect("failure reason");
    assert!(reason.starts_with("ArtifactPersistFailure"), "reason was {reason}");

    let report = harness.drain(launcher.clone(), 1).await;
    assert_eq!(report.completed, 1);
    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 2);
    assert!(matches!(
        job.result,
        Some(Artifact::Object { ref key, .. }) if *key == format!("renders/{}-2.png", handle.id)
    ));

    assert_eq!(launcher.loads.load(Ordering::SeqCst), 1);
    let stored = bucket.stored.lock().expect("lock").clone();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].1, photo_png().len());
    assert!(harness.artifacts.staged(&handle.id).await.expect("read").is_none());
}

#[tokio::test]
async fn panicking_render_is_retried_with_backoff() {
    let harness = Harness::new();
    let handle = harness
        .service
        .enqueue(
            TemplateRef::Path("card.json".to_string()),
            Mapping::new(),
            RenderOptions::default(),
        )
        .await
        .expect("enqueued");
    let launcher = Arc::new(CountingLauncher {
        panic_on_load: true,
        ..CountingLauncher::new()
    });

    let before = OffsetDateTime::now_utc();
    let report = harness.drain(launcher, 1).await;
    assert_eq!(report.errors, 1);

    let job = harness.service.get_status(&handle.id).await.expect("job");
    assert_eq!(job.state, JobState::Delayed);
    assert!(job.run_at > before);
    assert_eq!(
        job.last_error.as_deref(),
        Some("RenderFailed: job handler panicked")
    );
}
