//! Engine access.
//!
//! The scheduler and runner talk to the engine through the [`EngineApi`]
//! trait so tests can substitute an in-process fake; [`client::EngineClient`]
//! is the HTTP implementation.

pub mod client;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::variables::VariableDto;
pub use client::EngineClient;
pub use types::{
    BpmnErrorRequest, CompleteRequest, ExtendLockRequest, FailureRequest, FetchAndLockRequest,
    FetchTopic, LockedTask, ReportStatus,
};

/// The engine surface the worker core depends on.
///
/// All report-shaped calls are idempotent against `Gone`: a 404/409 means
/// the lease was already reclaimed and is never an error.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Long-poll for work. Cancellation is dropping the future; the
    /// underlying connection is closed and no tasks are returned.
    async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
    ) -> Result<Vec<LockedTask>, EngineError>;

    async fn complete(
        &self,
        task_id: &str,
        request: &CompleteRequest,
    ) -> Result<ReportStatus, EngineError>;

    async fn fail(
        &self,
        task_id: &str,
        request: &FailureRequest,
    ) -> Result<ReportStatus, EngineError>;

    async fn bpmn_error(
        &self,
        task_id: &str,
        request: &BpmnErrorRequest,
    ) -> Result<ReportStatus, EngineError>;

    async fn extend_lock(
        &self,
        task_id: &str,
        request: &ExtendLockRequest,
    ) -> Result<ReportStatus, EngineError>;

    /// Upload one process variable, used for artifacts and for outputs too
    /// large to inline into a terminal report.
    async fn set_variable(
        &self,
        process_instance_id: &str,
        name: &str,
        value: &VariableDto,
    ) -> Result<ReportStatus, EngineError>;
}

/// Shared handle to an engine backend.
pub type Engine = Arc<dyn EngineApi>;
