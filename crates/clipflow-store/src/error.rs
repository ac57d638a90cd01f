use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt column {column}: {source}")]
    Decode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt timestamp in {column}: {source}")]
    Timestamp {
        column: &'static str,
        #[source]
        source: chrono::ParseError,
    },

    #[error("could not encode {column}: {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StoreError> for clipflow_core::Error {
    fn from(e: StoreError) -> Self {
        clipflow_core::Error::store(e.to_string())
    }
}
