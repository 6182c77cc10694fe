//! HTTP implementation of [`EngineApi`] against the engine REST API.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::WorkerConfig;
use crate::engine::types::{
    BpmnErrorRequest, CompleteRequest, ExtendLockRequest, FailureRequest, FetchAndLockRequest,
    LockedTask, ReportStatus,
};
use crate::engine::EngineApi;
use crate::error::EngineError;
use crate::variables::VariableDto;

/// Engine REST client. One instance is shared by the driver and all
/// runners; the connection pool must admit `max_jobs + 1` concurrent
/// requests so the long poll never starves terminal reports.
pub struct EngineClient {
    base_url: String,
    worker_id: String,
    client: reqwest::Client,
    timeout: std::time::Duration,
    poll_ttl: std::time::Duration,
}

impl EngineClient {
    pub fn new(config: &WorkerConfig) -> Result<Self, EngineError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(authorization) = &config.authorization {
            let mut value = reqwest::header::HeaderValue::from_str(
                authorization.expose_secret(),
            )
            .map_err(|_| {
                EngineError::InvalidResponse("authorization header is not valid ASCII".into())
            })?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(config.max_jobs + 1)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            worker_id: config.worker_id.clone(),
            client,
            timeout: config.timeout,
            poll_ttl: config.poll_ttl,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Map a report-shaped response: 2xx accepted, 404/409 gone, 5xx
    /// transient, anything else permanent.
    async fn report_status(
        response: reqwest::Response,
    ) -> Result<ReportStatus, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(ReportStatus::Accepted);
        }
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::CONFLICT {
            return Ok(ReportStatus::Gone);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(EngineError::Transient {
                reason: format!("status {status}: {body}"),
            });
        }
        Err(EngineError::Permanent {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_report<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ReportStatus, EngineError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        Self::report_status(response).await
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
    ) -> Result<Vec<LockedTask>, EngineError> {
        // The engine ends the long poll, not the client, so allow the full
        // poll TTL plus the normal per-call deadline on top.
        let response = self
            .client
            .post(self.url("/external-task/fetchAndLock"))
            .timeout(self.poll_ttl + self.timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Vec<LockedTask>>()
                .await
                .map_err(|e| EngineError::InvalidResponse(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(EngineError::Transient {
                reason: format!("status {status}: {body}"),
            });
        }
        Err(EngineError::Permanent {
            status: status.as_u16(),
            body,
        })
    }

    async fn complete(
        &self,
        task_id: &str,
        request: &CompleteRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.post_report(&format!("/external-task/{task_id}/complete"), request)
            .await
    }

    async fn fail(
        &self,
        task_id: &str,
        request: &FailureRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.post_report(&format!("/external-task/{task_id}/failure"), request)
            .await
    }

    async fn bpmn_error(
        &self,
        task_id: &str,
        request: &BpmnErrorRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.post_report(&format!("/external-task/{task_id}/bpmnError"), request)
            .await
    }

    async fn extend_lock(
        &self,
        task_id: &str,
        request: &ExtendLockRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.post_report(&format!("/external-task/{task_id}/extendLock"), request)
            .await
    }

    async fn set_variable(
        &self,
        process_instance_id: &str,
        name: &str,
        value: &VariableDto,
    ) -> Result<ReportStatus, EngineError> {
        let response = self
            .client
            .put(self.url(&format!(
                "/process-instance/{process_instance_id}/variables/{name}"
            )))
            .timeout(self.timeout)
            .json(value)
            .send()
            .await?;
        Self::report_status(response).await
    }
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("base_url", &self.base_url)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}
