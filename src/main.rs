use std::{path::Path, process, sync::Arc, time::Duration};

use cardsmith::{
    application::{
        artifacts::ArtifactStore,
        error::AppError,
        jobs::{
            JobWorkerContext, RenderJobService, RenderOptions, RetryPolicy, TemplateRef,
            TemplateResolver, Worker, WorkerOptions, WorkerReport, wait_for_job_completion,
        },
        render::RenderExecutor,
        repos::JobsRepo,
    },
    config,
    domain::template::Mapping,
    infra::{
        db::PostgresRepositories,
        engine,
        error::InfraError,
        http::{self, ApiKey, HttpState},
        memory::MemoryJobsRepo,
        s3::S3ObjectStore,
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

/// How long `enqueue` keeps an in-process worker alive when no database is configured.
const LOCAL_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Worker(_) => run_worker(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Enqueue(args) => run_enqueue(settings, args).await,
    }
}

/// Everything the commands share: one store, one engine pool, one artifact sink.
struct Runtime {
    repo: Arc<dyn JobsRepo>,
    durable: bool,
    executor: RenderExecutor,
    artifacts: Arc<ArtifactStore>,
    templates: Arc<TemplateResolver>,
    policy: RetryPolicy,
}

impl Runtime {
    async fn build(settings: &config::Settings) -> Result<Self, AppError> {
        let (repo, durable) = init_repository(settings).await?;
        let executor = engine::build_executor(&settings.engine)?;

        Ok(Self {
            repo,
            durable,
            executor,
            artifacts: Arc::new(build_artifacts(&settings.artifacts)?),
            templates: Arc::new(TemplateResolver::new(settings.templates.root.clone())),
            policy: RetryPolicy {
                attempts: settings.queue.attempts.get(),
                backoff_base: settings.queue.backoff_base,
            },
        })
    }

    fn jobs(&self) -> RenderJobService {
        RenderJobService::new(Arc::clone(&self.repo), self.policy)
    }

    fn worker_context(&self) -> JobWorkerContext {
        JobWorkerContext {
            repo: Arc::clone(&self.repo),
            executor: self.executor.clone(),
            artifacts: Arc::clone(&self.artifacts),
            templates: Arc::clone(&self.templates),
            policy: self.policy,
        }
    }

    async fn close(&self) {
        self.executor.pool().shutdown().await;
        self.repo.close().await;
    }
}

async fn init_repository(
    settings: &config::Settings,
) -> Result<(Arc<dyn JobsRepo>, bool), AppError> {
    let Some(database_url) = settings.database.url.as_deref() else {
        info!(
            target = "cardsmith::bootstrap",
            "No database configured; jobs are kept in memory"
        );
        return Ok((Arc::new(MemoryJobsRepo::new()), false));
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok((Arc::new(PostgresRepositories::new(pool)), true))
}

fn build_artifacts(settings: &config::ArtifactSettings) -> Result<ArtifactStore, AppError> {
    let store = ArtifactStore::local(settings.output_dir.clone())
        .with_presign(settings.presign, settings.presign_ttl);

    match settings.s3.as_ref() {
        Some(s3) => {
            let object_store = S3ObjectStore::new(s3)?;
            info!(
                target = "cardsmith::bootstrap",
                bucket = %s3.bucket,
                endpoint = %s3.endpoint,
                "Artifacts are uploaded to object storage"
            );
            Ok(store.with_object_store(
                Arc::new(object_store),
                s3.bucket.clone(),
                settings.key_prefix.clone(),
            ))
        }
        None => Ok(store),
    }
}

fn worker_options(settings: &config::WorkerSettings) -> WorkerOptions {
    WorkerOptions {
        concurrency: settings.concurrency.get() as usize,
        max_jobs: settings.max_jobs.map(|max| max.get()),
        idle_timeout: settings.idle_timeout,
        poll_interval: settings.poll_interval,
        lease: settings.lease,
        ..WorkerOptions::default()
    }
}

fn log_report(report: &WorkerReport) {
    info!(
        target = "cardsmith::jobs::worker",
        claimed = report.claimed,
        completed = report.completed,
        retried = report.retried,
        failed = report.failed,
        errors = report.errors,
        stop_reason = ?report.stop_reason,
        "Worker stopped"
    );
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runtime = Runtime::build(&settings).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = settings.server.embedded_worker.then(|| {
        // The embedded worker lives as long as the server does.
        let options = WorkerOptions {
            max_jobs: None,
            idle_timeout: None,
            ..worker_options(&settings.worker)
        };
        let worker = Worker::new(runtime.worker_context(), options);
        tokio::spawn(worker.run(shutdown_rx.clone()))
    });

    if !runtime.durable && !settings.server.embedded_worker {
        warn!(
            target = "cardsmith::bootstrap",
            "In-memory queue without an embedded worker; enqueued jobs will never run"
        );
    }

    let state = HttpState {
        jobs: runtime.jobs(),
        executor: runtime.executor.clone(),
        templates: Arc::clone(&runtime.templates),
        artifacts: Arc::clone(&runtime.artifacts),
        api_key: settings.server.api_key.as_deref().map(ApiKey::new),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "cardsmith::bootstrap",
        addr = %settings.server.addr,
        embedded_worker = settings.server.embedded_worker,
        "HTTP server listening"
    );

    tokio::spawn(forward_shutdown_signal(shutdown_tx));

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    match worker_handle {
        Some(handle) => {
            match tokio::time::timeout(settings.server.graceful_shutdown, handle).await {
                Ok(Ok(report)) => log_report(&report),
                Ok(Err(err)) => {
                    error!(target = "cardsmith::bootstrap", error = %err, "Embedded worker crashed");
                    runtime.close().await;
                }
                Err(_) => {
                    warn!(
                        target = "cardsmith::bootstrap",
                        timeout = ?settings.server.graceful_shutdown,
                        "Embedded worker did not drain before the shutdown deadline"
                    );
                    runtime.close().await;
                }
            }
        }
        None => runtime.close().await,
    }

    info!(target = "cardsmith::bootstrap", "Shutdown complete");
    Ok(())
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    let runtime = Runtime::build(&settings).await?;
    if !runtime.durable {
        warn!(
            target = "cardsmith::bootstrap",
            "Standalone worker without a database only sees its own in-memory queue"
        );
    }

    let worker = Worker::new(runtime.worker_context(), worker_options(&settings.worker));
    let health = worker.health();

    let listener = tokio::net::TcpListener::bind(settings.worker.health_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "cardsmith::bootstrap",
        addr = %settings.worker.health_addr,
        "Worker health endpoint listening"
    );
    let health_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, http::build_health_router(health)).await {
            error!(target = "cardsmith::bootstrap", error = %err, "Health endpoint stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown_signal(shutdown_tx));

    let report = worker.run(shutdown_rx).await;
    log_report(&report);

    health_server.abort();
    let _ = health_server.await;
    Ok(())
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let templates = TemplateResolver::new(settings.templates.root.clone());
    let reference = TemplateRef::Path(args.template.display().to_string());
    let template = templates
        .resolve(&reference)
        .await
        .map_err(|err| AppError::validation(err.reason()))?;
    let mapping = read_mapping(args.mapping.as_deref()).await?;

    let executor = engine::build_executor(&settings.engine)?;
    let rendered = executor.render(&template, &mapping).await;
    executor.pool().shutdown().await;
    let image = rendered?;

    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }
    tokio::fs::write(&args.output, &image.png)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "cardsmith::render",
        output = %args.output.display(),
        width = image.width,
        height = image.height,
        bytes = image.png.len(),
        "Wrote render"
    );
    Ok(())
}

async fn run_enqueue(settings: config::Settings, args: config::EnqueueArgs) -> Result<(), AppError> {
    let runtime = Runtime::build(&settings).await?;
    let mapping = read_mapping(args.mapping.as_deref()).await?;
    let options = RenderOptions {
        object_key: args.object_key,
        presign: args.presign.then_some(true),
        ..RenderOptions::default()
    };

    let handle = runtime
        .jobs()
        .enqueue(TemplateRef::Path(args.template), mapping, options)
        .await?;
    println!("{}", handle.id);

    if runtime.durable {
        runtime.repo.close().await;
        return Ok(());
    }

    // Nothing else can see an in-memory queue, so drain it here.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let options = WorkerOptions {
        max_jobs: Some(1),
        idle_timeout: None,
        ..worker_options(&settings.worker)
    };
    let worker = tokio::spawn(Worker::new(runtime.worker_context(), options).run(shutdown_rx));

    let outcome =
        wait_for_job_completion(runtime.repo.as_ref(), &handle.id, LOCAL_ENQUEUE_TIMEOUT).await;
    let _ = shutdown_tx.send(true);
    if let Ok(report) = worker.await {
        log_report(&report);
    }

    let job = outcome.map_err(|err| AppError::unexpected(format!("job {}: {err}", handle.id)))?;
    if let Some(result) = job.result {
        let described = serde_json::to_string(&result)
            .map_err(|err| AppError::unexpected(err.to_string()))?;
        println!("{described}");
    }
    Ok(())
}

async fn read_mapping(path: Option<&Path>) -> Result<Mapping, AppError> {
    let Some(path) = path else {
        return Ok(Mapping::new());
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        AppError::validation(format!(
            "mapping `{}` is not a JSON object of strings: {err}",
            path.display()
        ))
    })
}

/// Flip the shutdown flag on Ctrl-C (and SIGTERM on unix).
async fn forward_shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "cardsmith::bootstrap", error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "cardsmith::bootstrap", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target = "cardsmith::bootstrap", "Shutdown requested");
    let _ = shutdown.send(true);
}
