//! Downstream submission with a one-shot tag-encoding fallback.
//!
//! Each task is pre-submitted with numeric tag ids first. When the
//! downstream rejects that payload in a way [`RetryPolicy`] classifies as a
//! parsing failure, the same task is retried exactly once with tag names.
//! Tasks are processed one after another and never affect each other's
//! outcome.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::provider::{DownstreamClient, FileType, PreSubmitRequest, TagEncoding};
use crate::tags::TagSet;
use crate::task::VideoTask;

/// Decides which downstream failures trigger the name-encoded retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// HTTP statuses treated as a format rejection.
    pub retry_on_status: Vec<u16>,
    /// Case-insensitive substrings of the error message that mark a format
    /// rejection.
    pub signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on_status: vec![400],
            signatures: [
                "parse",
                "parsing",
                "invalid format",
                "format error",
                "deserialize",
                "unexpected token",
                "格式",
                "解析",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn is_parsing_failure(&self, err: &Error) -> bool {
        match err.kind() {
            ErrorKind::Parsing => true,
            ErrorKind::Validation | ErrorKind::Server => {
                if err
                    .status()
                    .is_some_and(|s| self.retry_on_status.contains(&s))
                {
                    return true;
                }
                let message = err.message().to_lowercase();
                self.signatures
                    .iter()
                    .any(|sig| message.contains(&sig.to_lowercase()))
            }
            _ => false,
        }
    }
}

/// Result of submitting one task.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub image_index: usize,
    pub image_name: String,
    pub task_id: Option<String>,
    /// Downstream material id, or the error of the last attempt.
    pub result: Result<String>,
    /// Network calls made for this task (0, 1 or 2).
    pub attempts: u8,
    /// Encoding of the last attempt, if any was made.
    pub encoding: Option<TagEncoding>,
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn material_id(&self) -> Option<&str> {
        self.result.as_deref().ok()
    }
}

/// One outcome per input task, in input order.
#[derive(Debug, Clone, Default)]
pub struct SubmissionReport {
    pub outcomes: Vec<SubmissionOutcome>,
}

impl SubmissionReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

struct EncodedTags {
    ids: String,
    names: String,
}

pub struct SubmissionPipeline {
    client: Arc<dyn DownstreamClient>,
    policy: RetryPolicy,
    file_type: FileType,
}

impl SubmissionPipeline {
    pub fn new(client: Arc<dyn DownstreamClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            file_type: FileType::Video,
        }
    }

    pub fn with_file_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    /// Submit every task in `tasks` against `product_id`.
    ///
    /// Batch-level input problems (empty product id, empty or disallowed tag
    /// names) are rejected before any network call. Per-task failures are
    /// reported in the returned [`SubmissionReport`].
    pub async fn submit(
        &self,
        tasks: &[VideoTask],
        product_id: &str,
        tags: &TagSet,
    ) -> Result<SubmissionReport> {
        if product_id.trim().is_empty() {
            return Err(Error::validation("product id must not be empty"));
        }
        if tags.is_empty() {
            return Err(Error::validation("at least one tag is required"));
        }
        let encoded = EncodedTags {
            ids: tags.id_encoding(),
            names: tags.name_encoding()?,
        };

        let mut report = SubmissionReport::default();
        for task in tasks {
            report
                .outcomes
                .push(self.submit_one(task, product_id, &encoded).await);
        }
        info!(
            product_id,
            total = report.outcomes.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "submission batch finished"
        );
        Ok(report)
    }

    async fn submit_one(
        &self,
        task: &VideoTask,
        product_id: &str,
        encoded: &EncodedTags,
    ) -> SubmissionOutcome {
        let mut outcome = SubmissionOutcome {
            image_index: task.image_index,
            image_name: task.image_name.clone(),
            task_id: task.task_id.clone(),
            result: Err(Error::internal("not attempted")),
            attempts: 0,
            encoding: None,
        };

        let file_path = match task.artifact_path() {
            Some(path) if task.is_submittable() => path.to_owned(),
            _ => {
                outcome.result = Err(Error::validation(format!(
                    "task {} is not ready for submission (status {})",
                    task.label(),
                    task.status
                )));
                return outcome;
            }
        };

        let mut request = PreSubmitRequest {
            product_id: product_id.to_owned(),
            file_type: self.file_type,
            file_path,
            tags: encoded.ids.clone(),
            tag_encoding: TagEncoding::Ids,
        };

        outcome.attempts = 1;
        outcome.encoding = Some(TagEncoding::Ids);
        let first = self.client.pre_submit(&request).await;
        let err = match first {
            Ok(material_id) => {
                outcome.result = Ok(material_id);
                return outcome;
            }
            Err(err) => err,
        };

        if !self.policy.is_parsing_failure(&err) {
            warn!(task = %task.label(), kind = %err.kind(), error = %err, "pre-submit failed");
            outcome.result = Err(err);
            return outcome;
        }

        warn!(
            task = %task.label(),
            error = %err,
            "pre-submit rejected id-encoded tags; retrying with tag names"
        );
        request.tags = encoded.names.clone();
        request.tag_encoding = TagEncoding::Names;
        outcome.attempts = 2;
        outcome.encoding = Some(TagEncoding::Names);
        outcome.result = self.client.pre_submit(&request).await;
        if let Err(e) = &outcome.result {
            warn!(task = %task.label(), kind = %e.kind(), error = %e, "name-encoded retry failed");
        }
        outcome
    }
}
