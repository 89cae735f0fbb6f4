//! Conversions from domain records into the wire DTOs of `cardsmith-api-types`.

use cardsmith_api_types::{ArtifactView, JobListResponse, JobView};

use crate::application::jobs::JobListing;
use crate::domain::entities::{Artifact, JobRecord};

pub fn artifact_view(artifact: &Artifact) -> ArtifactView {
    match artifact {
        Artifact::Local { path } => ArtifactView::Local { path: path.clone() },
        Artifact::Object {
            bucket,
            key,
            presigned,
        } => ArtifactView::Object {
            bucket: bucket.clone(),
            key: key.clone(),
            url: presigned.as_ref().map(|p| p.url.clone()),
            expires_at: presigned.as_ref().map(|p| p.expires_at),
        },
    }
}

pub fn job_view(job: &JobRecord) -> JobView {
    JobView {
        id: job.id.clone(),
        state: job.state.as_str().to_string(),
        attempts_made: u32::try_from(job.attempts).unwrap_or(0),
        max_attempts: u32::try_from(job.max_attempts).unwrap_or(0),
        result: job.result.as_ref().map(artifact_view),
        failed_reason: job.last_error.clone(),
        created_at: job.created_at,
        updated_at: job.updated_at,
        run_at: job.run_at,
        finished_at: job.finished_at,
    }
}

pub fn job_list(listing: &JobListing) -> JobListResponse {
    JobListResponse {
        jobs: listing.jobs.iter().map(job_view).collect(),
        page: listing.page,
        limit: listing.limit,
        total: listing.total,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::domain::{entities::PresignedUrl, types::JobState};

    #[test]
    fn failed_job_exposes_reason_and_attempts() {
        let at = datetime!(2026-01-02 03:04:05 UTC);
        let job = JobRecord {
            id: "abc".into(),
            payload: serde_json::json!({ "template": "card.json" }),
            state: JobState::Failed,
            attempts: 3,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            run_at: at,
            locked_by: None,
            locked_at: None,
            result: None,
            last_error: Some("RenderFailed: blank".into()),
            created_at: at,
            updated_at: at,
            finished_at: Some(at),
        };

        let view = job_view(&job);
        assert_eq!(view.state, "failed");
        assert_eq!(view.attempts_made, 3);
        assert_eq!(view.failed_reason.as_deref(), Some("RenderFailed: blank"));
    }

    #[test]
    fn object_artifact_carries_presigned_url() {
        let expires_at = datetime!(2026-01-02 04:04:05 UTC);
        let view = artifact_view(&Artifact::Object {
            bucket: "cards".into(),
            key: "renders/abc-1.png".into(),
            presigned: Some(PresignedUrl {
                url: "https://example.test/cards/renders/abc-1.png?sig".into(),
                expires_at,
            }),
        });
        assert_eq!(
            view,
            ArtifactView::Object {
                bucket: "cards".into(),
                key: "renders/abc-1.png".into(),
                url: Some("https://example.test/cards/renders/abc-1.png?sig".into()),
                expires_at: Some(expires_at),
            }
        );
    }
}
