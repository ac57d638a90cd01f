//! Interfaces to the external collaborators the core drives.
//!
//! Wire formats of concrete providers live outside this crate; see the
//! `clipflow-http` crate for HTTP implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::error::{Error, Result};

/// Input for one generation job.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub image_url: String,
    pub image_name: String,
    pub prompt: String,
    /// Provider-specific knobs (duration, ratio, avatar id, ...), passed through.
    pub params: serde_json::Value,
}

/// Remote job state as reported by the generation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub artifact_url: Option<String>,
    pub preview_url: Option<String>,
    pub failure_reason: Option<String>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            artifact_url: None,
            preview_url: None,
            failure_reason: None,
        }
    }

    pub fn succeeded(artifact_url: impl Into<String>) -> Self {
        Self {
            state: JobState::Succeeded,
            artifact_url: Some(artifact_url.into()),
            ..Self::pending()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            failure_reason: Some(reason.into()),
            ..Self::pending()
        }
    }
}

/// Image-to-video (or image-to-avatar) generation service.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit a job; returns the provider's job id.
    async fn submit(&self, request: &GenerationRequest) -> Result<String>;

    async fn status(&self, job_id: &str) -> Result<JobStatus>;
}

/// Downloads a produced artifact.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Where a persisted artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub local_path: PathBuf,
    pub relative_path: PathBuf,
}

/// Durable destination for fetched artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist `bytes` under `relative_path`. On error nothing is left at
    /// the destination.
    async fn persist(&self, bytes: Bytes, relative_path: &Path) -> Result<StoredArtifact>;

    /// Remove whatever exists at `relative_path`, including partial writes.
    async fn discard(&self, relative_path: &Path) -> Result<()>;
}

/// Writes artifacts below a root directory via a temporary file and rename,
/// so readers never observe a half-written artifact.
#[derive(Debug, Clone)]
pub struct LocalArtifactSink {
    root: PathBuf,
}

impl LocalArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative_path: &Path) -> Result<PathBuf> {
        if relative_path.is_absolute()
            || relative_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::validation(format!(
                "artifact path must stay inside the download root: {}",
                relative_path.display()
            )));
        }
        Ok(self.root.join(relative_path))
    }

    fn partial_path(dest: &Path) -> PathBuf {
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(".part");
        dest.with_file_name(name)
    }
}

#[async_trait]
impl ArtifactSink for LocalArtifactSink {
    async fn persist(&self, bytes: Bytes, relative_path: &Path) -> Result<StoredArtifact> {
        let dest = self.resolve(relative_path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = Self::partial_path(&dest);
        let written = async {
            tokio::fs::write(&partial, &bytes).await?;
            tokio::fs::rename(&partial, &dest).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        debug!(path = %dest.display(), size = bytes.len(), "artifact persisted");
        Ok(StoredArtifact {
            local_path: dest,
            relative_path: relative_path.to_path_buf(),
        })
    }

    async fn discard(&self, relative_path: &Path) -> Result<()> {
        let dest = self.resolve(relative_path)?;
        for path in [Self::partial_path(&dest), dest] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "artifact discarded"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Kind of material handed to the downstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Video,
    Image,
}

/// Which tag representation a pre-submit request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TagEncoding {
    /// Comma-joined numeric tag ids.
    Ids,
    /// Comma-joined tag display names.
    Names,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreSubmitRequest {
    pub product_id: String,
    pub file_type: FileType,
    pub file_path: String,
    pub tags: String,
    pub tag_encoding: TagEncoding,
}

/// Content-management backend that accepts finished material.
///
/// Failures are classified through [`Error`]: `Validation`, `Auth`,
/// `Parsing`, `Server`, or `Transport`.
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    /// Returns the downstream material id.
    async fn pre_submit(&self, request: &PreSubmitRequest) -> Result<String>;
}
