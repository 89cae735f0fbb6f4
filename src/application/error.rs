use std::error::Error as StdError;

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{
    application::{compose::ComposeError, render::RenderError, repos::RepoError},
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Failure of one render-job attempt, classified for the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderJobError {
    #[error("{0}")]
    InvalidTemplate(String),
    #[error("{0}")]
    EngineUnavailable(String),
    #[error("{0}")]
    RenderFailed(String),
    #[error("template `{reference}` not found (tried {tried:?})")]
    TemplateNotFound {
        reference: String,
        tried: Vec<String>,
    },
    #[error("{0}")]
    ArtifactPersistFailure(String),
}

impl RenderJobError {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderJobError::InvalidTemplate(_) => "InvalidTemplate",
            RenderJobError::EngineUnavailable(_) => "EngineUnavailable",
            RenderJobError::RenderFailed(_) => "RenderFailed",
            RenderJobError::TemplateNotFound { .. } => "TemplateNotFound",
            RenderJobError::ArtifactPersistFailure(_) => "ArtifactPersistFailure",
        }
    }

    /// Fatal errors fail the job immediately; retrying cannot change the outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderJobError::InvalidTemplate(_) | RenderJobError::TemplateNotFound { .. }
        )
    }

    /// The reason recorded on the job: `"{kind}: {message}"`.
    pub fn reason(&self) -> String {
        format!("{}: {self}", self.kind())
    }
}

impl From<RenderError> for RenderJobError {
    fn from(error: RenderError) -> Self {
        match error {
            RenderError::InvalidTemplate(message) => Self::InvalidTemplate(message),
            RenderError::EngineUnavailable(message) => Self::EngineUnavailable(message),
            RenderError::RenderFailed(message) => Self::RenderFailed(message),
        }
    }
}

impl From<ComposeError> for RenderJobError {
    fn from(error: ComposeError) -> Self {
        RenderError::from(error).into()
    }
}

/// Errors surfaced by the job orchestrator to its callers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job `{id}` not found")]
    NotFound { id: String },
    #[error("job `{id}` is active")]
    Active { id: String },
    #[error("invalid job request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Repo(RepoError),
}

impl JobError {
    pub(crate) fn from_repo(id: &str, error: RepoError) -> Self {
        match error {
            RepoError::NotFound => JobError::NotFound { id: id.to_string() },
            RepoError::Conflict { .. } => JobError::Active { id: id.to_string() },
            other => JobError::Repo(other),
        }
    }
}

impl From<RepoError> for JobError {
    fn from(error: RepoError) -> Self {
        JobError::Repo(error)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_template_errors_are_fatal() {
        assert!(RenderJobError::InvalidTemplate("no size".into()).is_fatal());
        assert!(
            RenderJobError::TemplateNotFound {
                reference: "card.json".into(),
                tried: vec![],
            }
            .is_fatal()
        );
        assert!(!RenderJobError::EngineUnavailable("down".into()).is_fatal());
        assert!(!RenderJobError::RenderFailed("blank".into()).is_fatal());
        assert!(!RenderJobError::ArtifactPersistFailure("disk full".into()).is_fatal());
    }

    #[test]
    fn reason_is_prefixed_with_kind() {
        let error = RenderJobError::from(ComposeError::InvalidTemplate(
            "template has no size".into(),
        ));
        assert_eq!(error.reason(), "InvalidTemplate: template has no size");
    }

    #[test]
    fn repo_conflict_maps_to_active() {
        let error = JobError::from_repo("abc", RepoError::conflict("active"));
        assert!(matches!(error, JobError::Active { id } if id == "abc"));
    }
}
