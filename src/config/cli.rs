use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the cardsmith binary.
#[derive(Debug, Parser)]
#[command(name = "cardsmith", version, about = "Template-driven image renderer")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CARDSMITH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP API (and the embedded worker when enabled).
    Serve(Box<ServeArgs>),
    /// Run a standalone render worker against the configured queue.
    Worker(WorkerArgs),
    /// Render one template to a PNG file without touching the queue.
    Render(RenderArgs),
    /// Put one render job on the queue and print its id.
    Enqueue(EnqueueArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the templates root directory.
    #[arg(long = "templates-root", value_name = "PATH")]
    pub templates_root: Option<PathBuf>,

    /// Override the rendering engine (raster|chrome).
    #[arg(long = "engine-kind", value_name = "KIND")]
    pub engine_kind: Option<String>,

    /// Override the number of concurrent engine sessions.
    #[arg(long = "engine-max-sessions", value_name = "COUNT")]
    pub engine_max_sessions: Option<u32>,

    /// Override the local artifact directory.
    #[arg(long = "artifacts-output-dir", value_name = "PATH")]
    pub artifacts_output_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Run a worker inside the HTTP process.
    #[arg(
        long = "embedded-worker",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub embedded_worker: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub common: CommonOverrides,

    /// Stop after claiming this many jobs.
    #[arg(long = "max-jobs", value_name = "COUNT")]
    pub max_jobs: Option<u64>,

    /// Exit after this many seconds without work.
    #[arg(long = "idle-timeout-seconds", value_name = "SECONDS")]
    pub idle_timeout_seconds: Option<u64>,

    /// Override the number of jobs processed concurrently.
    #[arg(long = "worker-concurrency", value_name = "COUNT")]
    pub concurrency: Option<u32>,

    /// Override the liveness endpoint port.
    #[arg(long = "health-port", value_name = "PORT")]
    pub health_port: Option<u16>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub common: CommonOverrides,

    /// Template JSON file.
    #[arg(long = "template", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub template: PathBuf,

    /// JSON object of placeholder values.
    #[arg(long = "mapping", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub mapping: Option<PathBuf>,

    /// Where to write the PNG.
    #[arg(long = "output", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub common: CommonOverrides,

    /// Template reference resolved by the worker.
    #[arg(long = "template", value_name = "PATH")]
    pub template: String,

    /// JSON object of placeholder values.
    #[arg(long = "mapping", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub mapping: Option<PathBuf>,

    /// Upload under this object key instead of the derived one.
    #[arg(long = "object-key", value_name = "KEY")]
    pub object_key: Option<String>,

    /// Mint a presigned URL once uploaded.
    #[arg(long = "presign", action = clap::ArgAction::SetTrue)]
    pub presign: bool,
}
