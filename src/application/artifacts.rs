//! Persistence of rendered images: object storage when configured, otherwise
//! the local output directory.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    application::jobs::RenderOptions,
    domain::entities::{Artifact, PresignedUrl},
};

pub const PNG_CONTENT_TYPE: &str = "image/png";
const STAGED_DIR: &str = ".staged";
const MAX_PRESIGN_TTL: Duration = Duration::from_secs(604_800);

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("presign failed: {0}")]
    Presign(String),
    #[error("invalid artifact name `{0}`")]
    InvalidName(String),
}

/// S3-compatible object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), ArtifactError>;

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ArtifactError>;
}

#[derive(Clone)]
struct ObjectTarget {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key_prefix: String,
}

#[derive(Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
    object: Option<ObjectTarget>,
    presign_by_default: bool,
    presign_ttl: Duration,
}

impl ArtifactStore {
    pub fn local(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            object: None,
            presign_by_default: false,
            presign_ttl: Duration::from_secs(3_600),
        }
    }

    pub fn with_object_store(
        mut self,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        self.object = Some(ObjectTarget {
            store,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
        });
        self
    }

    pub fn with_presign(mut self, by_default: bool, ttl: Duration) -> Self {
        self.presign_by_default = by_default;
        self.presign_ttl = ttl.min(MAX_PRESIGN_TTL);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn uses_object_storage(&self) -> bool {
        self.object.is_some()
    }

    pub fn local_path(&self, job_id: &str, attempt: u32) -> Result<PathBuf, ArtifactError> {
        let id = checked_id(job_id)?;
        Ok(self.output_dir.join(format!("{id}-{attempt}.png")))
    }

    fn staged_path(&self, job_id: &str) -> Result<PathBuf, ArtifactError> {
        let id = checked_id(job_id)?;
        Ok(self.output_dir.join(STAGED_DIR).join(format!("{id}.png")))
    }

    /// Store the image for `attempt` of `job_id` and describe where it went.
    pub async fn persist(
        &self,
        job_id: &str,
        attempt: u32,
        png: Bytes,
        options: &RenderOptions,
    ) -> Result<Artifact, ArtifactError> {
        match &self.object {
            Some(target) => self.upload(target, job_id, attempt, png, options).await,
            None => {
                let path = self.local_path(job_id, attempt)?;
                write_atomically(&path, &png).await?;
                debug!(
                    target = "cardsmith::artifacts",
                    job_id,
                    path = %path.display(),
                    "Wrote local artifact"
                );
                Ok(Artifact::Local {
                    path: path.display().to_string(),
                })
            }
        }
    }

    async fn upload(
        &self,
        target: &ObjectTarget,
        job_id: &str,
        attempt: u32,
        png: Bytes,
        options: &RenderOptions,
    ) -> Result<Artifact, ArtifactError> {
        let key = match options.object_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => retry_key(key.trim_start_matches('/'), attempt),
            _ => format!("{}{}-{attempt}.png", target.key_prefix, checked_id(job_id)?),
        };

        target
            .store
            .put(&target.bucket, &key, png, PNG_CONTENT_TYPE)
            .await?;

        let presigned = if options.presign.unwrap_or(self.presign_by_default) {
            let ttl = options
                .presign_ttl()
                .unwrap_or(self.presign_ttl)
                .min(MAX_PRESIGN_TTL);
            match target.store.presign(&target.bucket, &key, ttl).await {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(
                        target = "cardsmith::artifacts",
                        job_id,
                        key = %key,
                        error = %err,
                        "Artifact stored but presigning failed"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Artifact::Object {
            bucket: target.bucket.clone(),
            key,
            presigned,
        })
    }

    /// Mint a read URL for an object this store uploaded earlier.
    /// `None` when no object storage is configured.
    pub async fn link(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<PresignedUrl>, ArtifactError> {
        match &self.object {
            Some(target) => target
                .store
                .presign(bucket, key, self.presign_ttl)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Keep rendered bytes whose persistence failed so the next attempt can skip rendering.
    pub async fn stage(&self, job_id: &str, png: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.staged_path(job_id)?;
        write_atomically(&path, png).await?;
        Ok(path)
    }

    pub async fn staged(&self, job_id: &str) -> Result<Option<Bytes>, ArtifactError> {
        let path = self.staged_path(job_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn clear_staged(&self, job_id: &str) {
        let Ok(path) = self.staged_path(job_id) else {
            return;
        };
        if let Err(err) = tokio::fs::remove_file(&path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                target = "cardsmith::artifacts",
                job_id,
                error = %err,
                "Failed to remove staged render"
            );
        }
    }
}

/// Job ids become file names, so only the uuid alphabet is accepted.
fn checked_id(job_id: &str) -> Result<&str, ArtifactError> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(job_id)
    } else {
        Err(ArtifactError::InvalidName(job_id.to_string()))
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// An explicit key names the first attempt; later attempts get `-{attempt}`
/// before the extension so a retry never overwrites an earlier upload.
fn retry_key(key: &str, attempt: u32) -> String {
    if attempt <= 1 {
        return key.to_string();
    }
    let file_start = key.rfind('/').map_or(0, |slash| slash + 1);
    match key[file_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, extension) = key.split_at(file_start + dot);
            format!("{stem}-{attempt}{extension}")
        }
        _ => format!("{key}-{attempt}"),
    }
}
