//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::*;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cardsmith";
const ENV_PREFIX: &str = "CARDSMITH";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_QUEUE_ATTEMPTS: u32 = 3;
const DEFAULT_QUEUE_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_ENGINE_MAX_SESSIONS: u32 = 2;
const DEFAULT_SETTLE_DELAY_MS: u64 = 150;
const DEFAULT_LOAD_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_CANVAS_PIXELS: u64 = crate::application::compose::DEFAULT_MAX_CANVAS_PIXELS;
const DEFAULT_TEMPLATES_ROOT: &str = "templates";
const DEFAULT_OUTPUT_DIR: &str = "out";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_KEY_PREFIX: &str = "renders/";
const DEFAULT_PRESIGN_TTL_SECS: u64 = 3_600;
/// SigV4 presigned URLs cannot outlive seven days.
const MAX_PRESIGN_TTL_SECS: u64 = 604_800;
const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_LEASE_SECS: u64 = 300;
const DEFAULT_HEALTH_HOST: &str = "127.0.0.1";
const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub engine: EngineSettings,
    pub templates: TemplateSettings,
    pub artifacts: ArtifactSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub api_key: Option<String>,
    pub graceful_shutdown: Duration,
    pub embedded_worker: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub attempts: NonZeroU32,
    pub backoff_base: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Raster,
    Chrome,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raster" => Ok(Self::Raster),
            "chrome" => Ok(Self::Chrome),
            other => Err(format!("unknown engine `{other}` (expected raster or chrome)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub kind: EngineKind,
    pub max_sessions: NonZeroU32,
    pub chrome_path: Option<PathBuf>,
    pub settle_delay: Duration,
    pub load_timeout: Duration,
    pub capture_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_canvas_pixels: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub output_dir: PathBuf,
    pub s3: Option<S3Settings>,
    pub key_prefix: String,
    pub presign: bool,
    pub presign_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: NonZeroU32,
    pub max_jobs: Option<NonZeroU64>,
    pub idle_timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// An `active` job whose lock is older than this is claimable again.
    pub lease: Duration,
    pub health_addr: SocketAddr,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(args),
        Some(Command::Worker(args)) => raw.apply_worker_overrides(args),
        Some(Command::Render(args)) => raw.apply_common_overrides(&args.common),
        Some(Command::Enqueue(args)) => raw.apply_common_overrides(&args.common),
        None => raw.apply_serve_overrides(&ServeArgs::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    queue: RawQueueSettings,
    engine: RawEngineSettings,
    templates: RawTemplateSettings,
    artifacts: RawArtifactSettings,
    worker: RawWorkerSettings,
}

impl RawSettings {
    fn apply_common_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(root) = overrides.templates_root.as_ref() {
            self.templates.root = Some(root.clone());
        }
        if let Some(kind) = overrides.engine_kind.as_ref() {
            self.engine.kind = Some(kind.clone());
        }
        if let Some(max) = overrides.engine_max_sessions {
            self.engine.max_sessions = Some(max);
        }
        if let Some(dir) = overrides.artifacts_output_dir.as_ref() {
            self.artifacts.output_dir = Some(dir.clone());
        }
    }

    fn apply_serve_overrides(&mut self, args: &ServeArgs) {
        self.apply_common_overrides(&args.common);
        if let Some(host) = args.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = args.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = args.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(embedded) = args.embedded_worker {
            self.server.embedded_worker = Some(embedded);
        }
    }

    fn apply_worker_overrides(&mut self, args: &WorkerArgs) {
        self.apply_common_overrides(&args.common);
        if let Some(max) = args.max_jobs {
            self.worker.max_jobs = Some(max);
        }
        if let Some(seconds) = args.idle_timeout_seconds {
            self.worker.idle_timeout_seconds = Some(seconds);
        }
        if let Some(concurrency) = args.concurrency {
            self.worker.concurrency = Some(concurrency);
        }
        if let Some(port) = args.health_port {
            self.worker.health_port = Some(port);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            queue,
            engine,
            templates,
            artifacts,
            worker,
        } = raw;

        let database = build_database_settings(database)?;
        let server = build_server_settings(server, &database)?;
        let logging = build_logging_settings(logging)?;
        let queue = build_queue_settings(queue)?;
        let engine = build_engine_settings(engine)?;
        let templates = build_template_settings(templates)?;
        let artifacts = build_artifact_settings(artifacts)?;
        let worker = build_worker_settings(worker)?;

        Ok(Self {
            server,
            logging,
            database,
            queue,
            engine,
            templates,
            artifacts,
            worker,
        })
    }
}

fn build_server_settings(
    server: RawServerSettings,
    database: &DatabaseSettings,
) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let api_key = non_empty(server.api_key);

    // Without a shared database nothing else can drain the in-memory queue.
    let embedded_worker = server
        .embedded_worker
        .unwrap_or(database.url.is_none());

    Ok(ServerSettings {
        addr,
        api_key,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        embedded_worker,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_empty(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let attempts = non_zero_u32(
        queue.attempts.unwrap_or(DEFAULT_QUEUE_ATTEMPTS).into(),
        "queue.attempts",
    )?;
    let backoff_base_ms = queue
        .backoff_base_ms
        .unwrap_or(DEFAULT_QUEUE_BACKOFF_BASE_MS);

    Ok(QueueSettings {
        attempts,
        backoff_base: Duration::from_millis(backoff_base_ms),
    })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let kind = match engine.kind {
        Some(kind) => {
            EngineKind::from_str(&kind).map_err(|reason| LoadError::invalid("engine.kind", reason))?
        }
        None => EngineKind::Raster,
    };

    let max_sessions = non_zero_u32(
        engine
            .max_sessions
            .unwrap_or(DEFAULT_ENGINE_MAX_SESSIONS)
            .into(),
        "engine.max_sessions",
    )?;

    let chrome_path = engine
        .chrome_path
        .filter(|path| !path.as_os_str().is_empty());

    let settle_delay =
        Duration::from_millis(engine.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS));
    let load_timeout = positive_millis(
        engine.load_timeout_ms.unwrap_or(DEFAULT_LOAD_TIMEOUT_MS),
        "engine.load_timeout_ms",
    )?;
    let capture_timeout = positive_millis(
        engine
            .capture_timeout_ms
            .unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS),
        "engine.capture_timeout_ms",
    )?;
    let acquire_timeout = positive_millis(
        engine
            .acquire_timeout_ms
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS),
        "engine.acquire_timeout_ms",
    )?;
    let max_canvas_pixels = NonZeroU64::new(
        engine
            .max_canvas_pixels
            .unwrap_or(DEFAULT_MAX_CANVAS_PIXELS),
    )
    .ok_or_else(|| LoadError::invalid("engine.max_canvas_pixels", "must be greater than zero"))?;

    Ok(EngineSettings {
        kind,
        max_sessions,
        chrome_path,
        settle_delay,
        load_timeout,
        capture_timeout,
        acquire_timeout,
        max_canvas_pixels,
    })
}

fn build_template_settings(templates: RawTemplateSettings) -> Result<TemplateSettings, LoadError> {
    let root = templates
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "templates.root",
            "path must not be empty",
        ));
    }
    Ok(TemplateSettings { root })
}

fn build_artifact_settings(artifacts: RawArtifactSettings) -> Result<ArtifactSettings, LoadError> {
    let output_dir = artifacts
        .output_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    if output_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "artifacts.output_dir",
            "path must not be empty",
        ));
    }

    let s3 = match non_empty(artifacts.s3_bucket) {
        Some(bucket) => {
            let region =
                non_empty(artifacts.s3_region).unwrap_or_else(|| DEFAULT_S3_REGION.to_string());
            let endpoint = non_empty(artifacts.s3_endpoint)
                .map(|endpoint| endpoint.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
            url::Url::parse(&endpoint).map_err(|err| {
                LoadError::invalid("artifacts.s3_endpoint", format!("invalid url: {err}"))
            })?;
            let access_key_id = non_empty(artifacts.s3_access_key_id).ok_or_else(|| {
                LoadError::invalid(
                    "artifacts.s3_access_key_id",
                    "required when artifacts.s3_bucket is set",
                )
            })?;
            let secret_access_key = non_empty(artifacts.s3_secret_access_key).ok_or_else(|| {
                LoadError::invalid(
                    "artifacts.s3_secret_access_key",
                    "required when artifacts.s3_bucket is set",
                )
            })?;
            Some(S3Settings {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            })
        }
        None => None,
    };

    let key_prefix = artifacts
        .key_prefix
        .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

    let ttl_secs = artifacts
        .presign_ttl_seconds
        .unwrap_or(DEFAULT_PRESIGN_TTL_SECS);
    if ttl_secs == 0 || ttl_secs > MAX_PRESIGN_TTL_SECS {
        return Err(LoadError::invalid(
            "artifacts.presign_ttl_seconds",
            format!("must be between 1 and {MAX_PRESIGN_TTL_SECS}"),
        ));
    }

    Ok(ArtifactSettings {
        output_dir,
        s3,
        key_prefix,
        presign: artifacts.presign.unwrap_or(false),
        presign_ttl: Duration::from_secs(ttl_secs),
    })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let concurrency = non_zero_u32(
        worker
            .concurrency
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
            .into(),
        "worker.concurrency",
    )?;

    let max_jobs = match worker.max_jobs {
        Some(value) => Some(
            NonZeroU64::new(value)
                .ok_or_else(|| LoadError::invalid("worker.max_jobs", "must be greater than zero"))?,
        ),
        None => None,
    };

    let idle_timeout = match worker.idle_timeout_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "worker.idle_timeout_seconds",
                "must be greater than zero",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => None,
    };

    let poll_interval = positive_millis(
        worker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        "worker.poll_interval_ms",
    )?;

    let lease = match worker.lease_seconds.unwrap_or(DEFAULT_LEASE_SECS) {
        0 => {
            return Err(LoadError::invalid(
                "worker.lease_seconds",
                "must be greater than zero",
            ));
        }
        seconds => Duration::from_secs(seconds),
    };

    let health_host = worker
        .health_host
        .unwrap_or_else(|| DEFAULT_HEALTH_HOST.to_string());
    let health_port = worker.health_port.unwrap_or(DEFAULT_HEALTH_PORT);
    let health_addr = parse_socket_addr(&health_host, health_port)
        .map_err(|reason| LoadError::invalid("worker.health_addr", reason))?;

    Ok(WorkerSettings {
        concurrency,
        max_jobs,
        idle_timeout,
        poll_interval,
        lease,
        health_addr,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    api_key: Option<String>,
    graceful_shutdown_seconds: Option<u64>,
    embedded_worker: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    kind: Option<String>,
    max_sessions: Option<u32>,
    chrome_path: Option<PathBuf>,
    settle_delay_ms: Option<u64>,
    load_timeout_ms: Option<u64>,
    capture_timeout_ms: Option<u64>,
    acquire_timeout_ms: Option<u64>,
    max_canvas_pixels: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTemplateSettings {
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawArtifactSettings {
    output_dir: Option<PathBuf>,
    s3_bucket: Option<String>,
    s3_region: Option<String>,
    s3_endpoint: Option<String>,
    s3_access_key_id: Option<String>,
    s3_secret_access_key: Option<String>,
    key_prefix: Option<String>,
    presign: Option<bool>,
    presign_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    concurrency: Option<u32>,
    max_jobs: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    lease_seconds: Option<u64>,
    health_host: Option<String>,
    health_port: Option<u16>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
