//! Task records and their lifecycle state machine.
//!
//! ```text
//! queued -> submitted -> processing -> completed -> downloading -> downloaded
//! queued | submitted | processing | downloading -> failed
//! ```
//!
//! `failed` is terminal. A failed attempt is retried by creating a new
//! [`VideoTask`], never by moving the old one backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Lifecycle state of a single generation attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created locally, not yet accepted by the generation service.
    Queued,
    /// Accepted by the generation service; `task_id` is set.
    Submitted,
    /// Observed in flight by the poller.
    Processing,
    /// The generation service reported success; `video_url` is set.
    Completed,
    /// Terminal failure; `error` is set.
    Failed,
    /// The produced artifact is being fetched.
    Downloading,
    /// The artifact is persisted locally; `local_path` / `relative_path` are set.
    Downloaded,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::Submitted,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Downloading,
        TaskStatus::Downloaded,
    ];

    /// Returns `true` if `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Submitted)
                | (Submitted, Processing)
                | (Processing, Completed)
                | (Completed, Downloading)
                | (Downloading, Downloaded)
                | (Queued | Submitted | Processing | Downloading, Failed)
        )
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Downloaded)
    }

    /// Accepted remotely and still waiting for an outcome.
    pub fn is_outstanding(self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Processing)
    }
}

/// One tracked image-to-video generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTask {
    /// External job id; `None` until the generation service accepts the job.
    pub task_id: Option<String>,
    pub image_index: usize,
    pub image_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Downstream material id once the artifact has been pre-submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_id: Option<String>,
    pub prompt: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoTask {
    pub fn new(
        image_index: usize,
        image_name: impl Into<String>,
        image_url: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: None,
            image_index,
            image_name: image_name.into(),
            status: TaskStatus::Queued,
            error: None,
            video_url: None,
            local_path: None,
            relative_path: None,
            preview_url: None,
            material_id: None,
            prompt: prompt.into(),
            image_url: image_url.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A label for logs and errors: the job id when known, else the image.
    pub fn label(&self) -> String {
        match &self.task_id {
            Some(id) => id.clone(),
            None => format!("{}#{}", self.image_name, self.image_index),
        }
    }

    /// Move to `next` if the lifecycle graph allows it. Re-entering the
    /// current state is a no-op.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task: self.label(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_submitted(&mut self, task_id: impl Into<String>) -> Result<()> {
        let task_id = task_id.into();
        if task_id.trim().is_empty() {
            return Err(Error::validation(format!(
                "generation service returned an empty job id for {}",
                self.label()
            )));
        }
        self.transition(TaskStatus::Submitted)?;
        self.task_id = Some(task_id);
        Ok(())
    }

    pub fn mark_processing(&mut self) -> Result<()> {
        self.transition(TaskStatus::Processing)
    }

    pub fn mark_completed(
        &mut self,
        video_url: impl Into<String>,
        preview_url: Option<String>,
    ) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.video_url = Some(video_url.into());
        if preview_url.is_some() {
            self.preview_url = preview_url;
        }
        Ok(())
    }

    pub fn mark_downloading(&mut self) -> Result<()> {
        self.transition(TaskStatus::Downloading)
    }

    pub fn mark_downloaded(
        &mut self,
        local_path: impl Into<String>,
        relative_path: impl Into<String>,
    ) -> Result<()> {
        self.transition(TaskStatus::Downloaded)?;
        self.local_path = Some(local_path.into());
        self.relative_path = Some(relative_path.into());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Eligible for downstream submission: downloaded and locatable on disk.
    pub fn is_submittable(&self) -> bool {
        self.status == TaskStatus::Downloaded
            && (self.relative_path.is_some() || self.local_path.is_some())
    }

    /// Path handed to the downstream service, preferring the relative one.
    pub fn artifact_path(&self) -> Option<&str> {
        self.relative_path
            .as_deref()
            .or(self.local_path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn task() -> VideoTask {
        VideoTask::new(0, "cat.png", "https://img.example/cat.png", "a cat waving")
    }

    #[test]
    fn happy_path_walks_the_main_chain() {
        let mut t = task();
        t.mark_submitted("job-1").unwrap();
        t.mark_processing().unwrap();
        t.mark_completed("https://cdn.example/v.mp4", None).unwrap();
        t.mark_downloading().unwrap();
        t.mark_downloaded("/data/s/cat-job-1.mp4", "s/cat-job-1.mp4").unwrap();
        assert_eq!(t.status, TaskStatus::Downloaded);
        assert_eq!(t.task_id.as_deref(), Some("job-1"));
        assert!(t.is_submittable());
    }

    #[test]
    fn only_graph_edges_are_allowed() {
        let allowed: &[(TaskStatus, TaskStatus)] = &[
            (TaskStatus::Queued, TaskStatus::Submitted),
            (TaskStatus::Submitted, TaskStatus::Processing),
            (TaskStatus::Processing, TaskStatus::Completed),
            (TaskStatus::Completed, TaskStatus::Downloading),
            (TaskStatus::Downloading, TaskStatus::Downloaded),
            (TaskStatus::Queued, TaskStatus::Failed),
            (TaskStatus::Submitted, TaskStatus::Failed),
            (TaskStatus::Processing, TaskStatus::Failed),
            (TaskStatus::Downloading, TaskStatus::Failed),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn failed_is_terminal() {
        let mut t = task();
        t.mark_failed("quota exceeded").unwrap();
        for next in TaskStatus::ALL {
            if next != TaskStatus::Failed {
                assert!(t.transition(next).is_err(), "failed -> {next}");
            }
        }
        assert_eq!(t.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn rejected_transition_leaves_record_untouched() {
        let mut t = task();
        let before = t.clone();
        let err = t.mark_downloading().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TaskStatus::Queued,
                to: TaskStatus::Downloading,
                ..
            }
        ));
        assert_eq!(t, before);
    }

    #[test]
    fn submitted_requires_job_id() {
        let mut t = task();
        assert!(t.mark_submitted("  ").is_err());
        assert_eq!(t.status, TaskStatus::Queued);
        assert!(t.task_id.is_none());
    }

    #[test]
    fn re_entering_processing_is_a_no_op() {
        let mut t = task();
        t.mark_submitted("job-2").unwrap();
        t.mark_processing().unwrap();
        t.mark_processing().unwrap();
        assert_eq!(t.status, TaskStatus::Processing);
    }

    #[test]
    fn submittable_iff_downloaded_with_a_path() {
        let paths = [
            (None, None),
            (Some("/abs/v.mp4"), None),
            (None, Some("rel/v.mp4")),
            (Some("/abs/v.mp4"), Some("rel/v.mp4")),
        ];
        for status in TaskStatus::ALL {
            for (local, relative) in paths {
                let mut t = task();
                t.status = status;
                t.local_path = local.map(str::to_owned);
                t.relative_path = relative.map(str::to_owned);
                let expected = status == TaskStatus::Downloaded
                    && (local.is_some() || relative.is_some());
                assert_eq!(t.is_submittable(), expected, "{status} {local:?} {relative:?}");
            }
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_str(&status.to_string()).unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&TaskStatus::Downloading).unwrap(),
            "\"downloading\""
        );
    }

    #[test]
    fn serializes_camel_case() {
        let mut t = task();
        t.mark_submitted("job-3").unwrap();
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["taskId"], "job-3");
        assert_eq!(json["imageIndex"], 0);
        assert_eq!(json["status"], "submitted");
        assert!(json.get("error").is_none());
    }
}
