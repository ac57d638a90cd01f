use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::persist::ActiveSession;
use crate::poller::{PollSummary, PollingEngine};
use crate::provider::{GenerationProvider, GenerationRequest};
use crate::submission::{SubmissionPipeline, SubmissionReport};
use crate::tags::TagSet;
use crate::task::VideoTask;

/// One source image to animate.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub image_name: String,
    pub image_url: String,
    pub prompt: String,
}

/// Drives tasks of the active session from submission to downstream
/// hand-off.
///
/// Every state change goes through the [`ActiveSession`], so it is visible
/// immediately and persisted by the debounced scheduler.
///
/// # Usage
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(session, provider, poller, submission);
/// orchestrator.generate(inputs, json!({ "duration": 5 })).await?;
/// let summary = orchestrator.poll().await?;
/// let report = orchestrator.submit_downloaded("product-1", &tags).await?;
/// ```
pub struct Orchestrator {
    session: ActiveSession,
    provider: Arc<dyn GenerationProvider>,
    poller: PollingEngine,
    submission: SubmissionPipeline,
}

impl Orchestrator {
    pub fn new(
        session: ActiveSession,
        provider: Arc<dyn GenerationProvider>,
        poller: PollingEngine,
        submission: SubmissionPipeline,
    ) -> Self {
        Self {
            session,
            provider,
            poller,
            submission,
        }
    }

    pub fn session(&self) -> &ActiveSession {
        &self.session
    }

    /// Create one queued task per input and submit them to the generation
    /// service in order.
    ///
    /// Inputs are validated before anything is recorded. A rejected
    /// submission fails only its own task. Returns the new task records.
    pub async fn generate(&self, inputs: Vec<GenerationInput>, params: Value) -> Result<Vec<VideoTask>> {
        if inputs.is_empty() {
            return Err(Error::validation("no images to generate from"));
        }
        for (index, input) in inputs.iter().enumerate() {
            if input.image_url.trim().is_empty() {
                return Err(Error::validation(format!("image {index} has no url")));
            }
            if input.prompt.trim().is_empty() {
                return Err(Error::validation(format!("image {index} has no prompt")));
            }
        }

        let tasks: Vec<VideoTask> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                VideoTask::new(index, &input.image_name, &input.image_url, &input.prompt)
            })
            .collect();
        let count = tasks.len();
        let first = self.session.push_tasks(tasks)?;
        info!(count, "generation batch queued");

        for (offset, input) in inputs.into_iter().enumerate() {
            let position = first + offset;
            let request = GenerationRequest {
                image_url: input.image_url,
                image_name: input.image_name,
                prompt: input.prompt,
                params: params.clone(),
            };
            let recorded = match self.provider.submit(&request).await {
                Ok(job_id) => self.session.update_task_at(position, |t| t.mark_submitted(job_id)),
                Err(e) => {
                    warn!(image = %request.image_name, kind = %e.kind(), error = %e, "generation submit failed");
                    self.session.update_task_at(position, |t| t.mark_failed(e.to_string()))
                }
            };
            match recorded {
                Ok(task) => info!(task_id = ?task.task_id, status = %task.status, image = %task.image_name, "task recorded"),
                Err(e) => {
                    // Most likely an empty job id; the task cannot be tracked.
                    warn!(image = %request.image_name, error = %e, "could not record submission");
                    let _ = self.session.update_task_at(position, |t| t.mark_failed(e.to_string()));
                }
            }
        }

        let current = self.session.get().ok_or(Error::NoActiveSession)?;
        Ok(current
            .video_tasks
            .get(first..first + count)
            .map(<[VideoTask]>::to_vec)
            .unwrap_or_default())
    }

    /// Poll every outstanding task of the session.
    pub async fn poll(&self) -> Result<PollSummary> {
        self.poller.run_outstanding(&self.session).await
    }

    /// Generate, then poll the jobs this batch created.
    pub async fn generate_and_poll(&self, inputs: Vec<GenerationInput>, params: Value) -> Result<PollSummary> {
        let tasks = self.generate(inputs, params).await?;
        let job_ids: Vec<String> = tasks
            .iter()
            .filter(|t| t.status.is_outstanding())
            .filter_map(|t| t.task_id.clone())
            .collect();
        self.poller.run(&self.session, &job_ids).await
    }

    /// Submit every downloaded task without a material id and record the
    /// material ids handed back.
    pub async fn submit_downloaded(&self, product_id: &str, tags: &TagSet) -> Result<SubmissionReport> {
        let current = self.session.get().ok_or(Error::NoActiveSession)?;
        let eligible: Vec<VideoTask> = current
            .video_tasks
            .into_iter()
            .filter(|t| t.is_submittable() && t.material_id.is_none())
            .collect();
        if eligible.is_empty() {
            info!(product_id, "nothing to submit");
            return Ok(SubmissionReport::default());
        }

        let report = self.submission.submit(&eligible, product_id, tags).await?;
        for outcome in &report.outcomes {
            let (Some(task_id), Some(material_id)) = (&outcome.task_id, outcome.material_id()) else {
                continue;
            };
            let material_id = material_id.to_owned();
            if let Err(e) = self.session.update_task(task_id, |t| {
                t.material_id = Some(material_id);
                Ok(())
            }) {
                warn!(task_id = %task_id, error = %e, "could not record material id");
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistConfig;
    use crate::poller::PollConfig;
    use crate::provider::{
        ArtifactFetcher, DownstreamClient, JobStatus, LocalArtifactSink, PreSubmitRequest,
    };
    use crate::session::MemorySessionStore;
    use crate::submission::RetryPolicy;
    use crate::tags::Tag;
    use crate::task::TaskStatus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;

    /// Accepts images whose name does not start with `bad`; every job
    /// succeeds on the first status call.
    #[derive(Default)]
    struct InstantProvider {
        requests: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl GenerationProvider for InstantProvider {
        async fn submit(&self, request: &GenerationRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            if request.image_name.starts_with("bad") {
                return Err(Error::ProviderFailure {
                    reason: "image rejected by moderation".into(),
                });
            }
            Ok(format!("job-{}", request.image_name))
        }

        async fn status(&self, job_id: &str) -> Result<JobStatus> {
            Ok(JobStatus::succeeded(format!("https://cdn.example/{job_id}.mp4")))
        }
    }

    struct BytesFetcher;

    #[async_trait]
    impl ArtifactFetcher for BytesFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes> {
            Ok(Bytes::from_static(b"mp4"))
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl DownstreamClient for AcceptAll {
        async fn pre_submit(&self, request: &PreSubmitRequest) -> Result<String> {
            Ok(format!("material:{}", request.file_path))
        }
    }

    async fn orchestrator(dir: &std::path::Path) -> (Orchestrator, Arc<InstantProvider>) {
        let session = ActiveSession::new(Arc::new(MemorySessionStore::new()), PersistConfig::default());
        session.open_project("product-1").await.unwrap();
        let provider = Arc::new(InstantProvider::default());
        let poller = PollingEngine::new(
            provider.clone(),
            Arc::new(BytesFetcher),
            Arc::new(LocalArtifactSink::new(dir)),
            PollConfig::default(),
        );
        let submission = SubmissionPipeline::new(Arc::new(AcceptAll), RetryPolicy::default());
        (Orchestrator::new(session, provider.clone(), poller, submission), provider)
    }

    fn input(name: &str) -> GenerationInput {
        GenerationInput {
            image_name: name.to_owned(),
            image_url: format!("https://img.example/{name}"),
            prompt: "slow zoom".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submit_fails_only_its_task() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, provider) = orchestrator(dir.path()).await;

        let tasks = orch
            .generate(vec![input("a.png"), input("bad.png")], json!({ "duration": 5 }))
            .await
            .unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Submitted);
        assert_eq!(tasks[0].task_id.as_deref(), Some("job-a.png"));
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert!(tasks[1].error.as_deref().unwrap().contains("moderation"));
        assert_eq!(provider.requests.lock().unwrap()[0].params["duration"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, provider) = orchestrator(dir.path()).await;

        let mut missing_prompt = input("b.png");
        missing_prompt.prompt = " ".into();
        let err = orch
            .generate(vec![input("a.png"), missing_prompt], Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(orch.session().get().unwrap().video_tasks.is_empty());
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_flow_records_material_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(dir.path()).await;

        let summary = orch
            .generate_and_poll(vec![input("a.png"), input("b.png")], Value::Null)
            .await
            .unwrap();
        assert_eq!(summary.completed, 2);

        let tags = TagSet::new([Tag::leaf(3, "夏日")]);
        let report = orch.submit_downloaded("product-1", &tags).await.unwrap();
        assert_eq!(report.succeeded(), 2);

        let session = orch.session().get().unwrap();
        for task in &session.video_tasks {
            assert_eq!(task.status, TaskStatus::Downloaded);
            let material = task.material_id.as_deref().unwrap();
            assert!(material.starts_with("material:"));
            assert!(dir.path().join(task.relative_path.as_deref().unwrap()).exists());
        }

        // Already submitted tasks are skipped.
        let again = orch.submit_downloaded("product-1", &tags).await.unwrap();
        assert!(again.outcomes.is_empty());
    }
}
