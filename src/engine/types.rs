//! Wire DTOs for the engine's external-task REST surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::variables::VariableDto;

/// Body of `POST /external-task/fetchAndLock`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAndLockRequest {
    pub worker_id: String,
    pub max_tasks: usize,
    /// Long-poll TTL in milliseconds; the engine holds the request up to
    /// this long waiting for work.
    pub async_response_timeout: u64,
    pub topics: Vec<FetchTopic>,
}

/// One topic subscription within a fetch request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTopic {
    pub topic_name: String,
    /// Lock duration in milliseconds.
    pub lock_duration: u64,
    /// Explicit variable name filter; omitted fetches all in scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<String>>,
    /// When true, only task-local variables are fetched.
    pub local_variables: bool,
    pub deserialize_values: bool,
}

/// One locked external task from a fetch response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedTask {
    pub id: String,
    pub topic_name: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Engine-formatted timestamp, e.g. `2026-03-01T12:30:00.000+0000`.
    #[serde(default)]
    pub lock_expiration_time: Option<String>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub process_definition_key: Option<String>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub variables: Option<HashMap<String, VariableDto>>,
    #[serde(default)]
    pub retries: Option<i32>,
}

/// Body of `POST /external-task/{id}/complete`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub worker_id: String,
    pub variables: HashMap<String, VariableDto>,
    pub local_variables: HashMap<String, VariableDto>,
}

/// Body of `POST /external-task/{id}/failure`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRequest {
    pub worker_id: String,
    pub error_message: String,
    pub error_details: String,
    /// Remaining retries; 0 tells the engine to raise an incident.
    pub retries: i32,
    /// Engine-side delay before the next retry, in milliseconds.
    pub retry_timeout: u64,
}

/// Body of `POST /external-task/{id}/bpmnError`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BpmnErrorRequest {
    pub worker_id: String,
    pub error_code: String,
    pub error_message: String,
    pub variables: HashMap<String, VariableDto>,
}

/// Body of `POST /external-task/{id}/extendLock`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendLockRequest {
    pub worker_id: String,
    /// New lock duration in milliseconds, measured from now.
    pub new_duration: u64,
}

/// Outcome of a report-shaped engine call. `Gone` folds 404 (task
/// reclaimed or reported elsewhere) and 409 (lock lost) together: both
/// mean this worker no longer owns the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Accepted,
    Gone,
}
