//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::package::FailurePolicy;

/// Default engine REST base URL.
pub const DEFAULT_ENGINE_BASE_URL: &str = "http://localhost:8080/engine-rest";

/// Default worker id prefix; a random suffix is appended per process.
pub const DEFAULT_WORKER_ID_PREFIX: &str = "task-bridge";

/// Executor binary looked up on PATH when not configured.
pub const DEFAULT_EXECUTABLE: &str = "task-exec";

/// Worker configuration, immutable after startup and threaded from the
/// entry point into every component.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Engine REST base URL, without trailing slash.
    pub base_url: String,
    /// Opaque Authorization header value, sent verbatim. Never logged.
    pub authorization: Option<SecretString>,
    /// Per-call deadline for all non-long-poll engine requests.
    pub timeout: Duration,
    /// Long-poll TTL: how long the engine may hold a fetch-and-lock call.
    pub poll_ttl: Duration,
    /// Initial and renewed lock duration per lease.
    pub lock_ttl: Duration,
    /// Opaque worker id sent with every engine request.
    pub worker_id: String,
    /// Cap on concurrent in-flight leases.
    pub max_jobs: usize,
    /// Failure policy applied when a topic's manifest omits one.
    pub default_on_failure: FailurePolicy,
    /// Secrets profile selected for packages that declare secrets.
    pub secrets_profile: Option<String>,
    /// Executor binary invoked per lease.
    pub executable: String,
    /// Retry budget assigned on the first failure when the engine reports
    /// no retry count for the lease.
    pub initial_retries: i32,
    /// Engine-side delay before a failed task is retried.
    pub retry_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENGINE_BASE_URL.to_string(),
            authorization: None,
            timeout: Duration::from_secs(20),
            poll_ttl: Duration::from_secs(20),
            lock_ttl: Duration::from_secs(30),
            worker_id: default_worker_id(),
            max_jobs: 1,
            default_on_failure: FailurePolicy::Fail,
            secrets_profile: None,
            executable: DEFAULT_EXECUTABLE.to_string(),
            initial_retries: 3,
            retry_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Build a config from environment variables, on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("ENGINE_REST_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| defaults.base_url.clone()),
            authorization: std::env::var("ENGINE_REST_AUTHORIZATION")
                .ok()
                .map(SecretString::from),
            timeout: env_secs("ENGINE_REST_TIMEOUT_SECONDS").unwrap_or(defaults.timeout),
            poll_ttl: env_secs("ENGINE_REST_POLL_TTL_SECONDS").unwrap_or(defaults.poll_ttl),
            lock_ttl: env_secs("ENGINE_REST_LOCK_TTL_SECONDS").unwrap_or(defaults.lock_ttl),
            worker_id: std::env::var("TASKS_WORKER_ID")
                .unwrap_or_else(|_| defaults.worker_id.clone()),
            max_jobs: std::env::var("TASKS_MAX_JOBS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_jobs),
            secrets_profile: std::env::var("TASKS_SECRETS_PROFILE").ok(),
            executable: std::env::var("TASKS_EXECUTABLE")
                .unwrap_or_else(|_| defaults.executable.clone()),
            ..defaults
        }
    }

    /// Validate constraints that cannot be expressed in the type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs < 1 {
            return Err(ConfigError::InvalidValue {
                key: "max_jobs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "base_url".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "worker_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.lock_ttl < Duration::from_secs(1) {
            return Err(ConfigError::InvalidValue {
                key: "lock_ttl".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

/// A worker id unique to this process.
pub fn default_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{DEFAULT_WORKER_ID_PREFIX}-{}", &suffix[..8])
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}
