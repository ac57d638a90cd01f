//! Client for an image-to-video generation service.
//!
//! Jobs are created with `POST {base}/v1/videos` and observed with
//! `GET {base}/v1/videos/{id}`. Status strings are matched
//! case-insensitively: `succeeded`/`completed`/`success` and
//! `failed`/`canceled`/`cancelled`/`error` are terminal, everything else
//! counts as pending.

use async_trait::async_trait;
use clipflow_core::{GenerationProvider, GenerationRequest, JobState, JobStatus};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use crate::client::{HttpConfig, ensure_success};
use crate::error::HttpError;

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(alias = "task_id", alias = "taskId")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Output {
    #[serde(default, alias = "url", alias = "videoUrl")]
    video_url: Option<String>,
    #[serde(default, alias = "previewUrl", alias = "cover_url")]
    preview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    output: Option<Output>,
    #[serde(default, alias = "videoUrl")]
    video_url: Option<String>,
    #[serde(default, alias = "error_message", alias = "failure_reason")]
    error: Option<String>,
}

impl StatusResponse {
    fn into_job_status(self) -> JobStatus {
        let state = parse_state(&self.status);
        let output = self.output.unwrap_or_default();
        JobStatus {
            state,
            artifact_url: output.video_url.or(self.video_url),
            preview_url: output.preview_url,
            failure_reason: match state {
                JobState::Failed => Some(
                    self.error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| format!("job ended with status {}", self.status)),
                ),
                _ => None,
            },
        }
    }
}

fn parse_state(status: &str) -> JobState {
    match status.trim().to_ascii_lowercase().as_str() {
        "succeeded" | "completed" | "success" => JobState::Succeeded,
        "failed" | "canceled" | "cancelled" | "error" => JobState::Failed,
        _ => JobState::Pending,
    }
}

pub struct HttpGenerationClient {
    config: HttpConfig,
    client: Client,
}

impl HttpGenerationClient {
    pub fn new(config: HttpConfig) -> Result<Self, HttpError> {
        let client = config.build_client()?;
        Ok(Self { config, client })
    }

    fn job_url(&self, job_id: &str) -> Result<Url, HttpError> {
        let mut url = Url::parse(&self.config.url("v1/videos"))
            .map_err(|e| HttpError::invalid(format!("bad generation base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| HttpError::invalid("generation base url cannot take a path"))?
            .push(job_id);
        Ok(url)
    }

    async fn create(&self, request: &GenerationRequest) -> Result<String, HttpError> {
        let response = self
            .client
            .post(self.config.url("v1/videos"))
            .json(request)
            .send()
            .await?;
        let created: CreateResponse = ensure_success(response).await?.json().await?;
        if created.id.trim().is_empty() {
            return Err(HttpError::invalid("generation service returned an empty job id"));
        }
        debug!(job_id = %created.id, image = %request.image_name, "generation job created");
        Ok(created.id)
    }

    async fn fetch_status(&self, job_id: &str) -> Result<JobStatus, HttpError> {
        let response = self.client.get(self.job_url(job_id)?).send().await?;
        let status: StatusResponse = ensure_success(response).await?.json().await?;
        debug!(job_id, status = %status.status, "job status");
        Ok(status.into_job_status())
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationClient {
    async fn submit(&self, request: &GenerationRequest) -> clipflow_core::Result<String> {
        Ok(self.create(request).await?)
    }

    async fn status(&self, job_id: &str) -> clipflow_core::Result<JobStatus> {
        Ok(self.fetch_status(job_id).await?)
    }
}
