//! Session state, partial updates, and the store interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::task::VideoTask;

/// The persisted workflow state for one project context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    /// Insertion order is submission order.
    #[serde(default)]
    pub video_tasks: Vec<VideoTask>,
    #[serde(default)]
    pub added_images: Vec<Value>,
    #[serde(default)]
    pub reference_images: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,
    #[serde(default)]
    pub conversation: Vec<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            video_tasks: Vec::new(),
            added_images: Vec::new(),
            reference_images: Vec::new(),
            prompts: Vec::new(),
            conversation: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&VideoTask> {
        self.video_tasks
            .iter()
            .find(|t| t.task_id.as_deref() == Some(task_id))
    }
}

/// A partial session update. Present fields replace the session's value;
/// absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_tasks: Option<Vec<VideoTask>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_images: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_images: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Vec<Value>>,
}

impl SessionPatch {
    pub fn video_tasks(tasks: Vec<VideoTask>) -> Self {
        Self {
            video_tasks: Some(tasks),
            ..Default::default()
        }
    }

    pub fn added_images(images: Vec<Value>) -> Self {
        Self {
            added_images: Some(images),
            ..Default::default()
        }
    }

    pub fn prompts(prompts: Vec<Value>) -> Self {
        Self {
            prompts: Some(prompts),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Names of the fields this patch carries, in wire form.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.video_tasks.is_some() {
            keys.push("videoTasks");
        }
        if self.added_images.is_some() {
            keys.push("addedImages");
        }
        if self.reference_images.is_some() {
            keys.push("referenceImages");
        }
        if self.prompts.is_some() {
            keys.push("prompts");
        }
        if self.conversation.is_some() {
            keys.push("conversation");
        }
        keys
    }

    /// Shallow merge: every field present in `newer` overwrites ours.
    pub fn merge(&mut self, newer: SessionPatch) {
        if newer.video_tasks.is_some() {
            self.video_tasks = newer.video_tasks;
        }
        if newer.added_images.is_some() {
            self.added_images = newer.added_images;
        }
        if newer.reference_images.is_some() {
            self.reference_images = newer.reference_images;
        }
        if newer.prompts.is_some() {
            self.prompts = newer.prompts;
        }
        if newer.conversation.is_some() {
            self.conversation = newer.conversation;
        }
    }

    /// Write the present fields into `session`. Does not touch `updated_at`,
    /// which only moves on a persisted write.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(v) = &self.video_tasks {
            session.video_tasks = v.clone();
        }
        if let Some(v) = &self.added_images {
            session.added_images = v.clone();
        }
        if let Some(v) = &self.reference_images {
            session.reference_images = v.clone();
        }
        if let Some(v) = &self.prompts {
            session.prompts = v.clone();
        }
        if let Some(v) = &self.conversation {
            session.conversation = v.clone();
        }
    }
}

/// Durable backing store for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Apply a partial update and refresh `updated_at`.
    async fn patch(&self, session_id: &str, patch: &SessionPatch) -> Result<()>;

    async fn create(&self, session: &Session) -> Result<()>;

    /// Most recently updated session for `project_id`.
    async fn find_by_project(&self, project_id: &str) -> Result<Option<Session>>;
}

/// Reuse the project's existing session or create a fresh one.
pub async fn open_or_create(store: &dyn SessionStore, project_id: &str) -> Result<Session> {
    if project_id.trim().is_empty() {
        return Err(Error::validation("project id must not be empty"));
    }
    if let Some(existing) = store.find_by_project(project_id).await? {
        tracing::debug!(session_id = %existing.id, project_id, "reusing session");
        return Ok(existing);
    }
    let session = Session::new(project_id);
    store.create(&session).await?;
    tracing::info!(session_id = %session.id, project_id, "session created");
    Ok(session)
}

/// In-process store. Keeps a log of every applied patch.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    patches: Arc<RwLock<Vec<(String, SessionPatch)>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful `patch` call, oldest first.
    pub async fn patch_log(&self) -> Vec<(String, SessionPatch)> {
        self.patches.read().await.clone()
    }

    /// Make subsequent `patch` calls fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn patch(&self, session_id: &str, patch: &SessionPatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::store("write rejected"));
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_owned(),
            })?;
        patch.apply_to(session);
        session.updated_at = Utc::now();
        self.patches
            .write()
            .await
            .push((session_id.to_owned(), patch.clone()));
        Ok(())
    }

    async fn create(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_project(&self, project_id: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.project_id == project_id)
            .max_by_key(|s| s.updated_at)
            .cloned())
    }
}
