mod context;
mod payload;
mod process;
mod queue;
mod service;
mod templates;
mod worker;

pub use context::JobWorkerContext;
pub use payload::{RenderJobPayload, RenderOptions, TemplateRef};
pub use process::process_render_job;
pub use queue::{RetryPolicy, enqueue_job, wait_for_job_completion};
pub use service::{JobHandle, JobListing, RenderJobService};
pub use templates::TemplateResolver;
pub use worker::{
    StopReason, Worker, WorkerHealth, WorkerHealthSnapshot, WorkerOptions, WorkerReport,
};
