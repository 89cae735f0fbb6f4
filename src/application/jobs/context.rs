use std::sync::Arc;

use super::{queue::RetryPolicy, templates::TemplateResolver};
use crate::application::{artifacts::ArtifactStore, render::RenderExecutor, repos::JobsRepo};

/// Shared context handed to every job the worker runs.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub repo: Arc<dyn JobsRepo>,
    pub executor: RenderExecutor,
    pub artifacts: Arc<ArtifactStore>,
    pub templates: Arc<TemplateResolver>,
    pub policy: RetryPolicy,
}
