use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use cardsmith_api_types::{
    EnqueueRequest, EnqueueResponse, JobActionResponse, JobOptions, RenderFromDataRequest,
    RenderRequest,
};
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::application::artifacts::PNG_CONTENT_TYPE;
use crate::application::compose::data::{mapping_from_data, player_card_spec};
use crate::application::error::{ErrorReport, RenderJobError};
use crate::application::jobs::{RenderOptions, TemplateRef};
use crate::domain::entities::Artifact;
use crate::domain::template::Template;

use super::HttpState;
use super::error::{ApiError, codes};
use super::models::{job_list, job_view};

#[derive(Debug, Deserialize)]
pub struct JobsListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn health(State(state): State<HttpState>) -> Response {
    match state.jobs.repo().health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error("infra::http::health", StatusCode::SERVICE_UNAVAILABLE, &err)
                .attach(&mut response);
            response
        }
    }
}

pub async fn render(
    State(state): State<HttpState>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(bad_body)?;
    let reference = template_ref(request.template, None, request.template_path)?;

    let template = state.templates.resolve(&reference).await?;
    let image = state
        .executor
        .render(&template, &request.mapping)
        .await
        .map_err(RenderJobError::from)?;

    Ok(([(header::CONTENT_TYPE, PNG_CONTENT_TYPE)], image.png).into_response())
}

pub async fn render_from_data(
    State(state): State<HttpState>,
    payload: Result<Json<RenderFromDataRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(bad_body)?;
    let reference = template_ref(request.template, None, request.template_path)?;
    let data = request
        .data
        .filter(|data| !data.is_null())
        .ok_or_else(|| ApiError::bad_request("data required", None))?;
    let spec = request.mapping_spec.unwrap_or_else(player_card_spec);
    let mapping = mapping_from_data(&data, &spec);

    let template = state.templates.resolve(&reference).await?;
    let image = state
        .executor
        .render(&template, &mapping)
        .await
        .map_err(RenderJobError::from)?;

    Ok(([(header::CONTENT_TYPE, PNG_CONTENT_TYPE)], image.png).into_response())
}

pub async fn enqueue(
    State(state): State<HttpState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let Json(request) = payload.map_err(bad_body)?;
    let JobOptions {
        template: option_template,
        object_key,
        presign,
        presign_ttl_seconds,
        attempts,
    } = request.options.unwrap_or_default();

    let reference = template_ref(request.template, option_template, request.template_path)?;
    let options = RenderOptions {
        object_key,
        presign,
        presign_ttl_seconds,
        attempts,
    };

    let handle = state
        .jobs
        .enqueue(reference, request.mapping, options)
        .await?;

    Ok(Json(EnqueueResponse {
        job_id: handle.id,
        status: "queued".to_string(),
    }))
}

pub async fn list_jobs(
    State(state): State<HttpState>,
    Query(query): Query<JobsListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = state.jobs.list(query.page, query.limit).await?;
    Ok(Json(job_list(&listing)))
}

pub async fn get_job(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.get_status(&id).await?;
    Ok(Json(job_view(&job)))
}

pub async fn retry_job(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<JobActionResponse>, ApiError> {
    let job = state.jobs.retry(&id).await?;
    Ok(Json(JobActionResponse {
        id: job.id,
        status: "retrying".to_string(),
    }))
}

pub async fn remove_job(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<JobActionResponse>, ApiError> {
    state.jobs.remove(&id).await?;
    Ok(Json(JobActionResponse {
        id,
        status: "removed".to_string(),
    }))
}

/// Serve a completed job's image: local files are streamed, objects redirect
/// to a presigned URL.
pub async fn artifact(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.jobs.get_status(&id).await?;
    let Some(artifact) = job.result else {
        return Err(ApiError::not_found("Job has no artifact yet"));
    };

    match artifact {
        Artifact::Local { path } => {
            let bytes = tokio::fs::read(&path).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    ApiError::new(
                        StatusCode::NOT_FOUND,
                        codes::NOT_FOUND,
                        "Artifact file is missing",
                        Some(path.clone()),
                    )
                } else {
                    ApiError::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        codes::ARTIFACT,
                        "Failed to read artifact",
                        Some(err.to_string()),
                    )
                }
            })?;
            let mime = mime_guess::from_path(&path).first_or(mime_guess::mime::IMAGE_PNG);
            Ok((
                [(header::CONTENT_TYPE, mime.essence_str().to_string())],
                Body::from(bytes),
            )
                .into_response())
        }
        Artifact::Object {
            bucket,
            key,
            presigned,
        } => {
            let url = match presigned {
                Some(url) if url.expires_at > OffsetDateTime::now_utc() => Some(url),
                _ => state.artifacts.link(&bucket, &key).await?,
            };
            match url {
                Some(url) => Ok(Redirect::temporary(&url.url).into_response()),
                None => Err(ApiError::new(
                    StatusCode::NOT_FOUND,
                    codes::NOT_FOUND,
                    "Artifact is not reachable from this server",
                    Some(format!("{bucket}/{key}")),
                )),
            }
        }
    }
}

/// Pick the template for a request: an inline `template` first, then
/// `options.template`, then `templatePath`. A string in either template slot
/// is treated as a path.
fn template_ref(
    template: Option<Value>,
    option_template: Option<Value>,
    template_path: Option<String>,
) -> Result<TemplateRef, ApiError> {
    let inline = [template, option_template]
        .into_iter()
        .flatten()
        .find(|value| !value.is_null());

    match inline {
        Some(Value::String(path)) => path_ref(path),
        Some(value) => serde_json::from_value::<Template>(value)
            .map(|template| TemplateRef::Inline(Box::new(template)))
            .map_err(|err| {
                ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    codes::INVALID_TEMPLATE,
                    "Template is invalid",
                    Some(err.to_string()),
                )
            }),
        None => match template_path {
            Some(path) => path_ref(path),
            None => Err(ApiError::bad_request(
                "templatePath or template required",
                None,
            )),
        },
    }
}

fn path_ref(path: String) -> Result<TemplateRef, ApiError> {
    if path.trim().is_empty() {
        return Err(ApiError::bad_request("templatePath is empty", None));
    }
    Ok(TemplateRef::Path(path))
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request("Request body is not valid JSON", Some(rejection.body_text()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn inline_template_wins_over_path() {
        let reference = template_ref(
            Some(json!({ "size": { "w": 10, "h": 10 }, "layers": [] })),
            None,
            Some("templates/card.json".into()),
        )
        .expect("resolves");
        assert!(matches!(reference, TemplateRef::Inline(_)));
    }

    #[test]
    fn option_template_is_used_when_top_level_is_absent() {
        let reference = template_ref(
            None,
            Some(json!("cards/front.json")),
            Some("templates/card.json".into()),
        )
        .expect("resolves");
        assert_eq!(reference, TemplateRef::Path("cards/front.json".into()));
    }

    #[test]
    fn missing_template_is_a_bad_request() {
        let error = template_ref(None, Some(Value::Null), None).expect_err("rejected");
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn malformed_inline_template_is_unprocessable() {
        let error = template_ref(Some(json!({ "layers": 5 })), None, None).expect_err("rejected");
        assert_eq!(error.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
