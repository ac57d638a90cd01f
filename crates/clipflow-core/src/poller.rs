//! Polling engine: observes outstanding generation jobs until they resolve.
//!
//! A run repeatedly sweeps the unresolved job ids, one status call at a time
//! in submission order, sleeping [`PollConfig::interval`] between sweeps.
//! Successful jobs are downloaded inside the sweep that observed them. The
//! run ends when every requested job has resolved or
//! [`PollConfig::timeout`] has elapsed; jobs still outstanding at that point
//! keep their last observed state and are reported as pending.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::persist::ActiveSession;
use crate::provider::{ArtifactFetcher, ArtifactSink, GenerationProvider, JobState, JobStatus};
use crate::task::{TaskStatus, VideoTask};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between two sweeps.
    pub interval: Duration,
    /// Wall-clock budget for one run.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// What a run observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub requested: usize,
    /// Jobs whose artifact is now downloaded.
    pub completed: usize,
    pub failed: usize,
    /// Job ids still unresolved when the run ended.
    pub pending: Vec<String>,
    /// Job ids that could not be tracked (unknown to the session, never
    /// submitted, or lost to a session switch).
    pub detached: Vec<String>,
    pub timed_out: bool,
}

enum Progress {
    Pending,
    Resolved,
    Detached,
}

pub struct PollingEngine {
    provider: Arc<dyn GenerationProvider>,
    fetcher: Arc<dyn ArtifactFetcher>,
    sink: Arc<dyn ArtifactSink>,
    config: PollConfig,
}

impl PollingEngine {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        fetcher: Arc<dyn ArtifactFetcher>,
        sink: Arc<dyn ArtifactSink>,
        config: PollConfig,
    ) -> Self {
        Self {
            provider,
            fetcher,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll every task of the active session that still awaits an outcome,
    /// including completed tasks whose artifact was never downloaded and
    /// downloads cut short by an earlier run.
    pub async fn run_outstanding(&self, session: &ActiveSession) -> Result<PollSummary> {
        let current = session.get().ok_or(Error::NoActiveSession)?;
        let job_ids: Vec<String> = current
            .video_tasks
            .iter()
            .filter(|t| {
                t.status.is_outstanding()
                    || matches!(t.status, TaskStatus::Completed | TaskStatus::Downloading)
            })
            .filter_map(|t| t.task_id.clone())
            .collect();
        self.run(session, &job_ids).await
    }

    /// Poll `job_ids` until each resolves or the budget runs out.
    pub async fn run(&self, session: &ActiveSession, job_ids: &[String]) -> Result<PollSummary> {
        let current = session.get().ok_or(Error::NoActiveSession)?;
        let session_id = current.id.clone();

        // Sweep order is submission order, whatever order the ids came in.
        let mut seen = HashSet::new();
        let mut outstanding: Vec<String> = job_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        outstanding.sort_by_key(|id| {
            current
                .video_tasks
                .iter()
                .position(|t| t.task_id.as_deref() == Some(id.as_str()))
                .unwrap_or(usize::MAX)
        });
        let requested = outstanding.clone();

        let mut summary = PollSummary {
            requested: outstanding.len(),
            ..Default::default()
        };
        info!(
            session_id = %session_id,
            requested = summary.requested,
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_secs = self.config.timeout.as_secs(),
            "polling started"
        );

        let deadline = Instant::now() + self.config.timeout;
        let mut sweep = 0u32;
        while !outstanding.is_empty() {
            sweep += 1;
            let mut still_pending = Vec::with_capacity(outstanding.len());
            let mut ids = std::mem::take(&mut outstanding).into_iter();
            while let Some(job_id) = ids.next() {
                if session.session_id().as_deref() != Some(session_id.as_str()) {
                    warn!(session_id = %session_id, "active session changed; abandoning poll run");
                    summary.detached.push(job_id);
                    summary.detached.extend(ids.by_ref());
                    break;
                }
                match self.check(session, &session_id, &job_id).await {
                    Progress::Pending => still_pending.push(job_id),
                    Progress::Resolved => {}
                    Progress::Detached => summary.detached.push(job_id),
                }
            }
            outstanding = still_pending;
            debug!(sweep, outstanding = outstanding.len(), "sweep finished");

            if outstanding.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                summary.timed_out = true;
                break;
            }
            tokio::time::sleep(self.config.interval.min(deadline - now)).await;
        }

        for job_id in &requested {
            match session.task(job_id).map(|t| t.status) {
                Some(TaskStatus::Downloaded) => summary.completed += 1,
                Some(TaskStatus::Failed) => summary.failed += 1,
                _ => {}
            }
        }
        summary.pending = outstanding;

        if summary.timed_out {
            warn!(
                session_id = %session_id,
                pending = ?summary.pending,
                "polling budget exhausted with jobs still pending"
            );
        }
        info!(
            session_id = %session_id,
            requested = summary.requested,
            completed = summary.completed,
            failed = summary.failed,
            pending = summary.pending.len(),
            sweeps = sweep,
            "polling finished"
        );
        Ok(summary)
    }

    async fn check(&self, session: &ActiveSession, session_id: &str, job_id: &str) -> Progress {
        let Some(task) = session.task(job_id) else {
            warn!(task_id = job_id, "job is not part of the active session");
            return Progress::Detached;
        };
        match task.status {
            TaskStatus::Queued => {
                warn!(task_id = job_id, "task was never submitted; not polling");
                return Progress::Detached;
            }
            // An interrupted download starts over from the artifact url.
            TaskStatus::Completed | TaskStatus::Downloading => {
                return self.download(session, session_id, &task).await;
            }
            TaskStatus::Downloaded | TaskStatus::Failed => {
                return Progress::Resolved;
            }
            TaskStatus::Submitted | TaskStatus::Processing => {}
        }

        let status = match self.provider.status(job_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(task_id = job_id, kind = %e.kind(), error = %e, "status check failed; will retry next sweep");
                return Progress::Pending;
            }
        };

        match status.state {
            JobState::Pending => {
                if task.status == TaskStatus::Submitted {
                    self.edit(session, job_id, VideoTask::mark_processing)
                } else {
                    Progress::Pending
                }
            }
            JobState::Failed => {
                let reason = status
                    .failure_reason
                    .unwrap_or_else(|| "generation failed".to_owned());
                info!(task_id = job_id, reason = %reason, "generation failed");
                match self.edit(session, job_id, |t| t.mark_failed(reason)) {
                    Progress::Pending => Progress::Resolved,
                    other => other,
                }
            }
            JobState::Succeeded => self.complete(session, session_id, job_id, status).await,
        }
    }

    async fn complete(
        &self,
        session: &ActiveSession,
        session_id: &str,
        job_id: &str,
        status: JobStatus,
    ) -> Progress {
        let Some(url) = status.artifact_url else {
            warn!(task_id = job_id, "provider reported success without an artifact url");
            let _ = self.edit(session, job_id, |t| {
                t.mark_failed("generation succeeded but no artifact url was returned")
            });
            return Progress::Resolved;
        };
        let preview = status.preview_url;
        let completed = session.update_task(job_id, |t| {
            t.mark_processing()?;
            t.mark_completed(url, preview)
        });
        match completed {
            Ok(task) => {
                info!(task_id = job_id, video_url = ?task.video_url, "generation completed");
                self.download(session, session_id, &task).await
            }
            Err(e) => {
                warn!(task_id = job_id, error = %e, "could not record completion");
                Progress::Detached
            }
        }
    }

    async fn download(&self, session: &ActiveSession, session_id: &str, task: &VideoTask) -> Progress {
        let job_id = task.label();
        let Some(url) = task.video_url.clone() else {
            let _ = self.edit(session, &job_id, |t| t.mark_failed("completed task has no video url"));
            return Progress::Resolved;
        };
        if let Progress::Detached = self.edit(session, &job_id, VideoTask::mark_downloading) {
            return Progress::Detached;
        }

        let relative = artifact_relative_path(session_id, task, &url);
        let result = async {
            let bytes = self.fetcher.fetch(&url).await?;
            self.sink.persist(bytes, Path::new(&relative)).await
        }
        .await;

        match result {
            Ok(stored) => {
                let local = stored.local_path.display().to_string();
                info!(task_id = %job_id, path = %local, "artifact downloaded");
                self.edit(session, &job_id, |t| t.mark_downloaded(local, relative.clone()));
            }
            Err(e) => {
                warn!(task_id = %job_id, error = %e, "artifact download failed");
                if let Err(discard) = self.sink.discard(Path::new(&relative)).await {
                    warn!(task_id = %job_id, error = %discard, "could not remove partial artifact");
                }
                self.edit(session, &job_id, |t| t.mark_failed(format!("download failed: {e}")));
            }
        }
        Progress::Resolved
    }

    /// Apply `edit` to the task; a task that can no longer be edited is
    /// detached from the run.
    fn edit<F>(&self, session: &ActiveSession, job_id: &str, edit: F) -> Progress
    where
        F: FnOnce(&mut VideoTask) -> Result<()>,
    {
        match session.update_task(job_id, edit) {
            Ok(_) => Progress::Pending,
            Err(e) => {
                warn!(task_id = job_id, error = %e, "task update rejected");
                Progress::Detached
            }
        }
    }
}

/// `{session_id}/{image stem}-{job_id}.{ext}`, with the extension taken from
/// the artifact url (default `mp4`).
fn artifact_relative_path(session_id: &str, task: &VideoTask, url: &str) -> String {
    let stem: String = Path::new(&task.image_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let stem = if stem.is_empty() { "video".to_owned() } else { stem };

    let path = url.split(['?', '#']).next().unwrap_or_default();
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("mp4");

    format!("{session_id}/{stem}-{}.{ext}", task.label())
}
