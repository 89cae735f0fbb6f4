use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::artifacts::ArtifactError;
use crate::application::error::{ErrorReport, JobError, RenderJobError};
use crate::application::repos::RepoError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const JOB_ACTIVE: &str = "job_active";
    pub const DUPLICATE: &str = "duplicate";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const INTEGRITY: &str = "integrity_error";
    pub const DB_TIMEOUT: &str = "db_timeout";
    pub const REPO: &str = "repo_error";
    pub const INVALID_TEMPLATE: &str = "invalid_template";
    pub const TEMPLATE_NOT_FOUND: &str = "template_not_found";
    pub const ENGINE_UNAVAILABLE: &str = "engine_unavailable";
    pub const RENDER_FAILED: &str = "render_failed";
    pub const ARTIFACT: &str = "artifact_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "API key required",
            None,
        )
    }

    pub fn forbidden() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            codes::FORBIDDEN,
            "API key is not valid",
            None,
        )
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }
}

impl From<RenderJobError> for ApiError {
    fn from(error: RenderJobError) -> Self {
        let hint = Some(error.to_string());
        match error {
            RenderJobError::InvalidTemplate(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                codes::INVALID_TEMPLATE,
                "Template is invalid",
                hint,
            ),
            RenderJobError::TemplateNotFound { .. } => Self::new(
                StatusCode::NOT_FOUND,
                codes::TEMPLATE_NOT_FOUND,
                "Template not found",
                hint,
            ),
            RenderJobError::EngineUnavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::ENGINE_UNAVAILABLE,
                "Rendering engine unavailable",
                hint,
            ),
            RenderJobError::RenderFailed(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::RENDER_FAILED,
                "Rendering failed",
                hint,
            ),
            RenderJobError::ArtifactPersistFailure(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::ARTIFACT,
                "Failed to store artifact",
                hint,
            ),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::NotFound { id } => Self::new(
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Job not found",
                Some(id),
            ),
            JobError::Active { id } => Self::new(
                StatusCode::CONFLICT,
                codes::JOB_ACTIVE,
                "Job is being processed",
                Some(id),
            ),
            JobError::Invalid(message) => {
                Self::bad_request("Invalid job request", Some(message))
            }
            JobError::Repo(err) => err.into(),
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(error: RepoError) -> Self {
        match error {
            RepoError::Duplicate { constraint } => Self::new(
                StatusCode::CONFLICT,
                codes::DUPLICATE,
                "Duplicate record",
                Some(constraint),
            ),
            RepoError::NotFound => Self::not_found("Resource not found"),
            RepoError::InvalidInput { message } => Self::new(
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                Some(message),
            ),
            RepoError::Integrity { message } => Self::new(
                StatusCode::CONFLICT,
                codes::INTEGRITY,
                "Integrity constraint violated",
                Some(message),
            ),
            RepoError::Conflict { message } => Self::new(
                StatusCode::CONFLICT,
                codes::JOB_ACTIVE,
                "Conflicting job state",
                Some(message),
            ),
            RepoError::Timeout => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::DB_TIMEOUT,
                "Database timeout",
                None,
            ),
            RepoError::Persistence(message) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REPO,
                "Persistence error",
                Some(message),
            ),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::InvalidName(name) => {
                Self::bad_request("Invalid artifact name", Some(name))
            }
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::ARTIFACT,
                "Artifact unavailable",
                Some(other.to_string()),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_errors_map_to_distinct_statuses() {
        let cases = [
            (
                RenderJobError::InvalidTemplate("no size".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                RenderJobError::TemplateNotFound {
                    reference: "card.json".into(),
                    tried: vec![],
                },
                StatusCode::NOT_FOUND,
            ),
            (
                RenderJobError::EngineUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RenderJobError::RenderFailed("blank".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn active_job_is_a_conflict() {
        let error = ApiError::from(JobError::Active { id: "abc".into() });
        assert_eq!(error.status(), StatusCode::CONFLICT);
        assert_eq!(error.code(), codes::JOB_ACTIVE);
    }
}
