//! SQLite implementation of [`SessionStore`].
//!
//! Migrations are embedded at compile time from `./migrations` and run by
//! [`SqliteSessionStore::connect`]. Queries use the runtime-checked
//! `sqlx::query` form so no `DATABASE_URL` is needed to build.
//!
//! Collections (`video_tasks`, `prompts`, ...) are stored as JSON text. A
//! partial update binds `NULL` for absent fields and lets `COALESCE` keep the
//! stored value.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use clipflow_core::{Session, SessionPatch, SessionStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;

type SessionRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

const SELECT_SESSION: &str = "SELECT id, project_id, video_tasks, added_images, reference_images, \
     prompts, conversation, created_at, updated_at FROM sessions";

#[derive(Clone, Debug)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://clipflow.db"`, or
    /// `"sqlite::memory:"` for tests. An in-memory database is held on a
    /// single connection that is never recycled.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url, "session store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_SESSION} WHERE id = ?1"))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(session_from_row).transpose()
    }

    async fn latest_for_project(&self, project_id: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_SESSION} WHERE project_id = ?1 ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(session_from_row).transpose()
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, project_id, video_tasks, added_images, reference_images, \
             prompts, conversation, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(encode("video_tasks", &session.video_tasks)?)
        .bind(encode("added_images", &session.added_images)?)
        .bind(encode("reference_images", &session.reference_images)?)
        .bind(encode("prompts", &session.prompts)?)
        .bind(encode("conversation", &session.conversation)?)
        .bind(timestamp(session.created_at))
        .bind(timestamp(session.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `false` when no row matched `session_id`.
    async fn patch_session(&self, session_id: &str, patch: &SessionPatch) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET \
                video_tasks = COALESCE(?1, video_tasks), \
                added_images = COALESCE(?2, added_images), \
                reference_images = COALESCE(?3, reference_images), \
                prompts = COALESCE(?4, prompts), \
                conversation = COALESCE(?5, conversation), \
                updated_at = ?6 \
             WHERE id = ?7",
        )
        .bind(encode_opt("video_tasks", &patch.video_tasks)?)
        .bind(encode_opt("added_images", &patch.added_images)?)
        .bind(encode_opt("reference_images", &patch.reference_images)?)
        .bind(encode_opt("prompts", &patch.prompts)?)
        .bind(encode_opt("conversation", &patch.conversation)?)
        .bind(timestamp(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        debug!(session_id, fields = ?patch.keys(), rows = result.rows_affected(), "session patched");
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> clipflow_core::Result<Option<Session>> {
        Ok(self.get_session(session_id).await?)
    }

    async fn patch(&self, session_id: &str, patch: &SessionPatch) -> clipflow_core::Result<()> {
        if self.patch_session(session_id, patch).await? {
            Ok(())
        } else {
            Err(clipflow_core::Error::SessionNotFound {
                session_id: session_id.to_owned(),
            })
        }
    }

    async fn create(&self, session: &Session) -> clipflow_core::Result<()> {
        Ok(self.insert_session(session).await?)
    }

    async fn find_by_project(&self, project_id: &str) -> clipflow_core::Result<Option<Session>> {
        Ok(self.latest_for_project(project_id).await?)
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &'static str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp { column, source })
}

fn encode<T: Serialize>(column: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode { column, source })
}

fn encode_opt<T: Serialize>(column: &'static str, value: &Option<T>) -> Result<Option<String>, StoreError> {
    value.as_ref().map(|v| encode(column, v)).transpose()
}

fn decode<T: DeserializeOwned>(column: &'static str, text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|source| StoreError::Decode { column, source })
}

fn session_from_row(row: SessionRow) -> Result<Session, StoreError> {
    let (
        id,
        project_id,
        video_tasks,
        added_images,
        reference_images,
        prompts,
        conversation,
        created_at,
        updated_at,
    ) = row;
    Ok(Session {
        id,
        project_id,
        video_tasks: decode("video_tasks", &video_tasks)?,
        added_images: decode("added_images", &added_images)?,
        reference_images: decode("reference_images", &reference_images)?,
        prompts: decode("prompts", &prompts)?,
        conversation: decode("conversation", &conversation)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
