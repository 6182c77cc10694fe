//! Error types for task-bridge.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Variable codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Duplicate topic '{topic}' declared by both {first} and {second}")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },

    #[error("No topics declared by any package")]
    NoTopics,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the engine REST API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 5xx, connection failures, timeouts. Retried with backoff at the
    /// call site; never crashes the scheduler.
    #[error("Transient engine error: {reason}")]
    Transient { reason: String },

    /// 4xx other than 404/409. The request will not succeed on retry.
    #[error("Engine rejected request ({status}): {body}")]
    Permanent { status: u16, body: String },

    #[error("Invalid response from engine: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transient {
            reason: e.to_string(),
        }
    }
}

/// Variable encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported variable type '{0}'")]
    UnsupportedType(String),

    #[error("Invalid date value '{value}': {reason}")]
    InvalidDate { value: String, reason: String },

    #[error("Invalid base64 payload for {kind}: {reason}")]
    InvalidBase64 { kind: String, reason: String },

    #[error("Expected {expected} payload for {kind}, got {got}")]
    WrongPayload {
        kind: String,
        expected: &'static str,
        got: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Package loading errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("Package {0} not found")]
    NotFound(PathBuf),

    #[error("Package {path} has no manifest ({manifest})")]
    ManifestMissing { path: PathBuf, manifest: String },

    #[error("Invalid manifest in {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("Unreadable archive {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Secrets resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Secrets profile '{profile}' not found; available: {available}")]
    UnknownProfile { profile: String, available: String },

    #[error("Missing {what} for {provider} secrets provider")]
    MissingConfig {
        provider: &'static str,
        what: &'static str,
    },

    #[error("Failed to read secrets from {source_desc}: {reason}")]
    ReadFailed { source_desc: String, reason: String },
}

/// Executor subprocess errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn executor '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Executor exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Malformed outputs file: {0}")]
    MalformedOutputs(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
