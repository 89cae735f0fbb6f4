use std::path::{Path, PathBuf};

use tracing::debug;

use super::payload::TemplateRef;
use crate::{application::error::RenderJobError, domain::template::Template};

/// Finds template files for path references.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    root: PathBuf,
}

impl TemplateResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate files for `reference`, in lookup order and without duplicates.
    pub fn candidates(&self, reference: &str) -> Vec<PathBuf> {
        let normalized = reference.trim().replace('\\', "/");
        let given = PathBuf::from(&normalized);
        let mut candidates = vec![given.clone()];

        if given.is_relative() {
            candidates.push(self.root.join(&given));
        }
        if let Some(name) = given.file_name() {
            candidates.push(self.root.join(name));
        }

        let mut unique: Vec<PathBuf> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }
        unique
    }

    pub async fn resolve(&self, reference: &TemplateRef) -> Result<Template, RenderJobError> {
        match reference {
            TemplateRef::Inline(template) => Ok(template.as_ref().clone()),
            TemplateRef::Path(path) => self.load(path).await,
        }
    }

    async fn load(&self, reference: &str) -> Result<Template, RenderJobError> {
        let mut tried = Vec::new();

        for candidate in self.candidates(reference) {
            debug!(
                target = "cardsmith::jobs::templates",
                reference,
                candidate = %candidate.display(),
                "Trying template candidate"
            );
            match tokio::fs::read(&candidate).await {
                Ok(bytes) => {
                    return serde_json::from_slice(&bytes).map_err(|err| {
                        RenderJobError::InvalidTemplate(format!(
                            "template `{}` is not valid JSON: {err}",
                            candidate.display()
                        ))
                    });
                }
                Err(_) => tried.push(candidate.display().to_string()),
            }
        }

        Err(RenderJobError::TemplateNotFound {
            reference: reference.to_string(),
            tried,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD: &str = r#"{"size":{"w":20,"h":10},"layers":[]}"#;

    #[test]
    fn candidates_try_given_then_root_then_basename() {
        let resolver = TemplateResolver::new("templates");
        let candidates = resolver.candidates("designs\\card.json");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("designs/card.json"),
                PathBuf::from("templates/designs/card.json"),
                PathBuf::from("templates/card.json"),
            ]
        );
    }

    #[tokio::test]
    async fn basename_under_root_is_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("card.json"), CARD)
            .await
            .expect("write");
        let resolver = TemplateResolver::new(dir.path());

        let template = resolver
            .resolve(&TemplateRef::Path("/nowhere/else/card.json".into()))
            .await
            .expect("resolved");
        assert_eq!(template.size.map(|size| size.w), Some(20.0));
    }

    #[tokio::test]
    async fn missing_template_lists_every_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = TemplateResolver::new(dir.path());

        let err = resolver
            .resolve(&TemplateRef::Path("missing.json".into()))
            .await
            .expect_err("not found");
        match err {
            RenderJobError::TemplateNotFound { reference, tried } => {
                assert_eq!(reference, "missing.json");
                assert_eq!(tried.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_an_invalid_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("broken.json"), "{ not json")
            .await
            .expect("write");
        let resolver = TemplateResolver::new(dir.path());

        let err = resolver
            .resolve(&TemplateRef::Path("broken.json".into()))
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), "InvalidTemplate");
    }
}
