//! CLI configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use clipflow_core::{PersistConfig, PollConfig, RetryPolicy};
use clipflow_http::HttpConfig;

/// Runtime configuration for the clipflow CLI.
///
/// Every field has a default so the CLI runs against a local setup without
/// any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx SQLite URL (default: `"sqlite://clipflow.db"`).
    pub database_url: String,

    /// Root directory for downloaded artifacts.
    pub download_dir: PathBuf,

    pub poll_interval: Duration,
    pub poll_timeout: Duration,

    /// Quiet period before buffered session updates are written.
    pub debounce: Duration,

    pub generation_url: String,
    pub generation_key: Option<String>,

    pub downstream_url: String,
    pub downstream_token: Option<String>,

    /// Extra message fragments that mark a downstream rejection as a tag
    /// format problem, comma separated.
    pub parsing_signatures: Vec<String>,

    pub http_timeout: Duration,

    /// `tracing` filter string, e.g. `"info"` or `"clipflow_core=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("CLIPFLOW_DATABASE_URL", "sqlite://clipflow.db"),
            download_dir: PathBuf::from(env_or("CLIPFLOW_DOWNLOAD_DIR", "./downloads")),
            poll_interval: Duration::from_millis(parse_env("CLIPFLOW_POLL_INTERVAL_MS", 3_000)),
            poll_timeout: Duration::from_secs(parse_env("CLIPFLOW_POLL_TIMEOUT_SECS", 300)),
            debounce: Duration::from_millis(parse_env("CLIPFLOW_DEBOUNCE_MS", 1_000)),
            generation_url: env_or("CLIPFLOW_GENERATION_URL", "http://127.0.0.1:8080"),
            generation_key: env_opt("CLIPFLOW_GENERATION_KEY"),
            downstream_url: env_or("CLIPFLOW_DOWNSTREAM_URL", "http://127.0.0.1:8081"),
            downstream_token: env_opt("CLIPFLOW_DOWNSTREAM_TOKEN"),
            parsing_signatures: split_list(&env_or("CLIPFLOW_PARSING_SIGNATURES", "")),
            http_timeout: Duration::from_secs(parse_env("CLIPFLOW_HTTP_TIMEOUT_SECS", 30)),
            log_level: env_or("CLIPFLOW_LOG", "info"),
            log_json: std::env::var("CLIPFLOW_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            timeout: self.poll_timeout,
        }
    }

    pub fn persist(&self) -> PersistConfig {
        PersistConfig {
            debounce: self.debounce,
        }
    }

    /// Default policy plus any configured signatures.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        for sig in &self.parsing_signatures {
            if !policy.signatures.contains(sig) {
                policy.signatures.push(sig.clone());
            }
        }
        policy
    }

    pub fn generation_http(&self) -> HttpConfig {
        with_token(
            HttpConfig::new(&self.generation_url).with_timeout(self.http_timeout),
            self.generation_key.as_deref(),
        )
    }

    pub fn downstream_http(&self) -> HttpConfig {
        with_token(
            HttpConfig::new(&self.downstream_url).with_timeout(self.http_timeout),
            self.downstream_token.as_deref(),
        )
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn with_token(config: HttpConfig, token: Option<&str>) -> HttpConfig {
    match token {
        Some(token) => config.with_token(token),
        None => config,
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
