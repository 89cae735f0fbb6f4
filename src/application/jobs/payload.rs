use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::template::{Mapping, Template};

/// Where the worker finds the template: embedded in the job or on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateRef {
    Path(String),
    Inline(Box<Template>),
}

impl TemplateRef {
    /// Short label for logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            TemplateRef::Path(path) => path.clone(),
            TemplateRef::Inline(template) => match template.template_id.as_deref() {
                Some(id) => format!("inline:{id}"),
                None => "inline".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presign: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presign_ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl RenderOptions {
    pub fn presign_ttl(&self) -> Option<Duration> {
        self.presign_ttl_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJobPayload {
    pub template: TemplateRef,
    #[serde(default)]
    pub mapping: Mapping,
    #[serde(default)]
    pub options: RenderOptions,
}
