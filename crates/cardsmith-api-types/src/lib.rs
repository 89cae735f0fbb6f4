//! Request and response bodies exchanged with the cardsmith HTTP API.
//!
//! Templates travel as raw JSON values here so clients do not need the
//! renderer's domain types to talk to the service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Per-job rendering options accepted on enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Inline template; takes precedence over `templatePath` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    /// Explicit object-storage key for the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    /// Mint a presigned read URL for the uploaded artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presign: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presign_ttl_seconds: Option<u64>,
    /// Override the configured maximum number of attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JobOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}

/// Synchronous render whose mapping is built from a data record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderFromDataRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Token -> dot path into `data`; defaults to the player-card tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_spec: Option<BTreeMap<String, String>>,
}

/// Where a completed job's image lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ArtifactView {
    #[serde(rename_all = "camelCase")]
    Local { path: String },
    #[serde(rename_all = "camelCase")]
    Object {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "time::serde::rfc3339::option"
        )]
        expires_at: Option<OffsetDateTime>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub state: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub result: Option<ArtifactView>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub run_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobActionResponse {
    pub id: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_request_accepts_original_field_names() {
        let body = serde_json::json!({
            "templatePath": "templates/card.json",
            "mapping": { "NAME": "Ada" },
            "options": { "presign": true }
        });
        let request: EnqueueRequest = serde_json::from_value(body).expect("valid body");
        assert_eq!(request.template_path.as_deref(), Some("templates/card.json"));
        assert_eq!(request.mapping.get("NAME").map(String::as_str), Some("Ada"));
        assert_eq!(request.options.and_then(|o| o.presign), Some(true));
    }

    #[test]
    fn artifact_view_is_tagged_by_kind() {
        let view = ArtifactView::Local {
            path: "out/abc-1.png".to_string(),
        };
        let value = serde_json::to_value(&view).expect("serializes");
        assert_eq!(value["kind"], "local");
        assert_eq!(value["path"], "out/abc-1.png");
    }
}
