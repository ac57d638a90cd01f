//! Debounced persistence for the active session.
//!
//! [`ActiveSession`] owns the in-memory copy of one session and the buffer of
//! partial updates not yet written to the [`SessionStore`]. Updates are
//! applied in memory right away; the buffer is written as a single partial
//! patch once no update has arrived for [`PersistConfig::debounce`].
//!
//! Every update and every session switch bumps a generation counter. A timer
//! only flushes if the generation it was armed with is still current, so an
//! aborted or superseded timer can never write, and a buffer belonging to a
//! previous session can never reach the store under the new session's id.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::session::{Session, SessionPatch, SessionStore, open_or_create};
use crate::task::VideoTask;

/// Default quiet period before a flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Quiet period measured from the most recent update.
    pub debounce: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    pending: SessionPatch,
    generation: u64,
    /// Armed timer, if any. Cleared by the timer itself once it starts writing.
    timer: Option<JoinHandle<()>>,
}

/// Handle to the session currently being worked on.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ActiveSession {
    inner: Arc<Mutex<Inner>>,
    store: Arc<dyn SessionStore>,
    config: PersistConfig,
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ActiveSession")
            .field("session_id", &inner.session.as_ref().map(|s| s.id.as_str()))
            .field("pending", &inner.pending.keys())
            .field("generation", &inner.generation)
            .finish()
    }
}

impl ActiveSession {
    pub fn new(store: Arc<dyn SessionStore>, config: PersistConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `session` the active one. Any armed timer is cancelled and its
    /// unflushed buffer discarded.
    pub fn switch_to(&self, session: Session) {
        let mut inner = self.lock();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let dropped = std::mem::take(&mut inner.pending);
        if !dropped.is_empty() {
            warn!(
                previous = ?inner.session.as_ref().map(|s| s.id.as_str()),
                fields = ?dropped.keys(),
                "discarding unflushed updates on session switch"
            );
        }
        inner.generation += 1;
        debug!(session_id = %session.id, "session loaded");
        inner.session = Some(session);
    }

    /// Load `session_id` from the store and make it active.
    pub async fn open(&self, session_id: &str) -> Result<Session> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_owned(),
            })?;
        self.switch_to(session.clone());
        Ok(session)
    }

    /// Make the project's session active, creating it if it does not exist.
    pub async fn open_project(&self, project_id: &str) -> Result<Session> {
        let session = open_or_create(self.store.as_ref(), project_id).await?;
        self.switch_to(session.clone());
        Ok(session)
    }

    /// Snapshot of the in-memory session, including unflushed updates.
    pub fn get(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.id.clone())
    }

    pub fn task(&self, task_id: &str) -> Option<VideoTask> {
        self.lock()
            .session
            .as_ref()
            .and_then(|s| s.task(task_id).cloned())
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Apply `patch` in memory now and schedule it for the next flush.
    ///
    /// Never awaits; must be called from within a tokio runtime.
    pub fn update(&self, patch: SessionPatch) -> Result<()> {
        let mut inner = self.lock();
        self.update_locked(&mut inner, patch)
    }

    fn update_locked(&self, inner: &mut Inner, patch: SessionPatch) -> Result<()> {
        let session = inner.session.as_mut().ok_or(Error::NoActiveSession)?;
        if patch.is_empty() {
            return Ok(());
        }
        patch.apply_to(session);
        inner.pending.merge(patch);
        inner.generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let generation = inner.generation;
        let this = self.clone();
        inner.timer = Some(tokio::spawn(async move {
            this.flush_after(generation).await;
        }));
        Ok(())
    }

    /// Append new task records and schedule the change.
    pub fn push_tasks(&self, tasks: Vec<VideoTask>) -> Result<usize> {
        let mut inner = self.lock();
        let session = inner.session.as_ref().ok_or(Error::NoActiveSession)?;
        let first = session.video_tasks.len();
        let mut all = session.video_tasks.clone();
        all.extend(tasks);
        self.update_locked(&mut inner, SessionPatch::video_tasks(all))?;
        Ok(first)
    }

    /// Edit the task at `position` in the session's task list.
    pub fn update_task_at<F>(&self, position: usize, edit: F) -> Result<VideoTask>
    where
        F: FnOnce(&mut VideoTask) -> Result<()>,
    {
        self.edit_tasks(|tasks| {
            tasks.get_mut(position).ok_or_else(|| Error::TaskNotFound {
                task: format!("position {position}"),
            })
        }, edit)
    }

    /// Edit the task whose external job id is `task_id`.
    pub fn update_task<F>(&self, task_id: &str, edit: F) -> Result<VideoTask>
    where
        F: FnOnce(&mut VideoTask) -> Result<()>,
    {
        self.edit_tasks(|tasks| {
            tasks
                .iter_mut()
                .find(|t| t.task_id.as_deref() == Some(task_id))
                .ok_or_else(|| Error::TaskNotFound {
                    task: task_id.to_owned(),
                })
        }, edit)
    }

    fn edit_tasks<S, F>(&self, select: S, edit: F) -> Result<VideoTask>
    where
        S: FnOnce(&mut Vec<VideoTask>) -> Result<&mut VideoTask>,
        F: FnOnce(&mut VideoTask) -> Result<()>,
    {
        let mut inner = self.lock();
        let session = inner.session.as_ref().ok_or(Error::NoActiveSession)?;
        let mut tasks = session.video_tasks.clone();
        let task = select(&mut tasks)?;
        edit(task)?;
        let edited = task.clone();
        self.update_locked(&mut inner, SessionPatch::video_tasks(tasks))?;
        Ok(edited)
    }

    /// Write the pending buffer now instead of waiting for the timer.
    pub async fn flush(&self) -> Result<()> {
        let taken = {
            let mut inner = self.lock();
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            Self::take_pending(&mut inner)
        };
        match taken {
            Some((session_id, patch)) => self.write(&session_id, patch).await,
            None => Ok(()),
        }
    }

    async fn flush_after(self, generation: u64) {
        tokio::time::sleep(self.config.debounce).await;
        let taken = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            // Detach: from here on the write must not be aborted by a later update.
            inner.timer = None;
            Self::take_pending(&mut inner)
        };
        if let Some((session_id, patch)) = taken {
            // Already logged inside `write`.
            let _ = self.write(&session_id, patch).await;
        }
    }

    fn take_pending(inner: &mut Inner) -> Option<(String, SessionPatch)> {
        if inner.pending.is_empty() {
            return None;
        }
        let session_id = inner.session.as_ref()?.id.clone();
        Some((session_id, std::mem::take(&mut inner.pending)))
    }

    async fn write(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        let fields = patch.keys();
        match self.store.patch(session_id, &patch).await {
            Ok(()) => {
                let mut inner = self.lock();
                if let Some(session) = inner.session.as_mut().filter(|s| s.id == session_id) {
                    session.updated_at = Utc::now();
                }
                debug!(session_id, ?fields, "session flushed");
                Ok(())
            }
            Err(e) => {
                error!(
                    session_id,
                    ?fields,
                    error = %e,
                    "session flush failed; these updates are not persisted"
                );
                Err(e)
            }
        }
    }
}
