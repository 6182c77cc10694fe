//! Per-lease executor runner.
//!
//! Runs the full pipeline for one lease: materialize a workspace, stage
//! inputs and secrets, spawn the executor subprocess, keep the lock alive
//! while it runs, harvest the outputs file, upload artifacts, and map the
//! result through the topic's failure policy. The workspace is removed on
//! every exit path.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::engine::{Engine, ExtendLockRequest, ReportStatus};
use crate::error::{EngineError, ExecutorError};
use crate::package::FailurePolicy;
use crate::registry::ResolvedTopic;
use crate::secrets::{Redactor, Secrets};
use crate::variables::{codec, TypedValue, VariableDto};
use crate::worker::lease::{Lease, LeaseState, TerminalReport};
use crate::worker::workspace::Workspace;
use crate::worker::Shutdown;

/// Cap on captured executor stdout/stderr.
const MAX_CAPTURE: usize = 64 * 1024;

/// Tail of stderr carried into failure reports.
const STDERR_TAIL: usize = 4096;

/// Window between SIGTERM and SIGKILL, and the shutdown grace window.
const GRACE: Duration = Duration::from_secs(10);

/// Wall-clock ceiling for one execution, as a multiple of the lock TTL.
const DEADLINE_FACTOR: u32 = 10;

/// Retry delay after a transient extend-lock failure.
const EXTEND_RETRY: Duration = Duration::from_secs(1);

/// Bound on draining captured output after the subprocess is reaped.
/// Orphaned grandchildren can hold the pipe open indefinitely.
const CAPTURE_DRAIN: Duration = Duration::from_secs(2);

/// Search-path variable handed to the executor (colon-separated).
pub const ENV_SEARCH_PATH: &str = "TASK_BRIDGE_SEARCH_PATH";

/// Why the monitor loop stopped waiting on the subprocess.
enum WaitOutcome {
    Exited(Option<std::process::ExitStatus>),
    LockLost,
    Interrupted,
    DeadlineExceeded,
}

enum ExtendResult {
    Extended,
    Lost,
    Retry,
}

/// Executes leases against the engine; shared by all in-flight runners.
pub struct TaskRunner {
    config: WorkerConfig,
    engine: Engine,
}

impl TaskRunner {
    pub fn new(config: WorkerConfig, engine: Engine) -> Self {
        Self { config, engine }
    }

    /// Run one lease to its terminal report. Artifact and oversized-output
    /// uploads happen here; the terminal call itself is the caller's.
    pub async fn execute(
        &self,
        lease: &mut Lease,
        topic: &ResolvedTopic,
        shutdown: &Shutdown,
    ) -> TerminalReport {
        info!(
            lease = %lease.id,
            topic = %lease.topic,
            entry = %topic.spec.entry,
            "Executing lease"
        );

        let package = Arc::clone(&topic.package);
        let workspace = match tokio::task::spawn_blocking(move || Workspace::create(&package))
            .await
        {
            Ok(Ok(workspace)) => workspace,
            Ok(Err(e)) => {
                return self
                    .failure_report(
                        lease,
                        topic,
                        None,
                        format!("workspace setup failed: {e}"),
                        String::new(),
                        BTreeMap::new(),
                        &Redactor::default(),
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .failure_report(
                        lease,
                        topic,
                        None,
                        format!("workspace setup panicked: {e}"),
                        String::new(),
                        BTreeMap::new(),
                        &Redactor::default(),
                    )
                    .await;
            }
        };

        let secrets: Secrets = match &topic.secrets {
            Some(provider) => match provider.read().await {
                Ok(secrets) => secrets,
                Err(e) => {
                    return self
                        .failure_report(
                            lease,
                            topic,
                            None,
                            format!("secrets resolution failed: {e}"),
                            String::new(),
                            BTreeMap::new(),
                            &Redactor::default(),
                        )
                        .await;
                }
            },
            None => Secrets::new(),
        };
        let redactor = Redactor::from_secrets(&secrets);

        if let Err(e) = workspace.stage_inputs(&build_inputs(lease, topic, &secrets)) {
            return self
                .failure_report(
                    lease,
                    topic,
                    None,
                    format!("failed to stage inputs: {e}"),
                    String::new(),
                    BTreeMap::new(),
                    &redactor,
                )
                .await;
        }

        let mut command = Command::new(&self.config.executable);
        command
            .arg(workspace.package_dir())
            .arg(&topic.spec.entry)
            .arg(workspace.inputs_path())
            .arg(workspace.outputs_path())
            .current_dir(workspace.work_dir())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command.env("ENGINE_REST_BASE_URL", &self.config.base_url);
        command.env(
            "LOG_LEVEL",
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        );
        command.env(ENV_SEARCH_PATH, search_path(topic, &workspace));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let spawn_error = ExecutorError::Spawn {
                    program: self.config.executable.clone(),
                    reason: e.to_string(),
                };
                return self
                    .failure_report(
                        lease,
                        topic,
                        None,
                        spawn_error.to_string(),
                        String::new(),
                        BTreeMap::new(),
                        &redactor,
                    )
                    .await;
            }
        };

        if let Err(e) = lease.transition_to(LeaseState::Running) {
            warn!(lease = %lease.id, "{e}");
        }

        let pid = child.id();
        let stdout_task = capture(child.stdout.take());
        let stderr_task = capture(child.stderr.take());

        let outcome = self.monitor(&mut child, pid, lease, shutdown).await;

        let stdout = join_capture(stdout_task).await;
        let stderr = join_capture(stderr_task).await;
        if !stdout.is_empty() {
            debug!(
                lease = %lease.id,
                "executor stdout: {}",
                redactor.mask(&String::from_utf8_lossy(&stdout))
            );
        }
        if !stderr.is_empty() {
            debug!(
                lease = %lease.id,
                "executor stderr: {}",
                redactor.mask(&String::from_utf8_lossy(&stderr))
            );
        }

        match outcome {
            WaitOutcome::LockLost => {
                if let Err(e) = lease.transition_to(LeaseState::Lost) {
                    warn!(lease = %lease.id, "{e}");
                }
                TerminalReport::Abandon
            }
            WaitOutcome::Interrupted => TerminalReport::Failure {
                error_message: "worker shutting down".to_string(),
                error_details: String::new(),
                retries: lease.retries.unwrap_or(self.config.initial_retries),
                retry_timeout: self.config.retry_timeout,
            },
            WaitOutcome::DeadlineExceeded => {
                let error =
                    ExecutorError::DeadlineExceeded(self.config.lock_ttl * DEADLINE_FACTOR);
                TerminalReport::Failure {
                    error_message: error.to_string(),
                    error_details: redactor.mask(&tail_str(&stderr, STDERR_TAIL)),
                    retries: self.next_retries(lease),
                    retry_timeout: self.config.retry_timeout,
                }
            }
            WaitOutcome::Exited(None) => {
                self.failure_report(
                    lease,
                    topic,
                    None,
                    "failed to reap executor".to_string(),
                    redactor.mask(&tail_str(&stderr, STDERR_TAIL)),
                    BTreeMap::new(),
                    &redactor,
                )
                .await
            }
            WaitOutcome::Exited(Some(status)) => {
                self.harvest(lease, topic, &workspace, status, &stderr, &redactor)
                    .await
            }
        }
    }

    /// Wait for the subprocess while keeping the lock lease alive.
    async fn monitor(
        &self,
        child: &mut tokio::process::Child,
        pid: Option<u32>,
        lease: &mut Lease,
        shutdown: &Shutdown,
    ) -> WaitOutcome {
        let lock_ttl = self.config.lock_ttl;
        let hard_deadline = Instant::now() + lock_ttl * DEADLINE_FACTOR;
        let mut next_renew = renew_instant(lease, lock_ttl);
        let mut shutdown_rx = shutdown.subscribe();
        let mut pending: Option<WaitOutcome> = None;
        let mut kill_at: Option<Instant> = None;

        loop {
            let kill_deadline =
                kill_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            tokio::select! {
                biased;
                status = child.wait() => {
                    return pending
                        .take()
                        .unwrap_or(WaitOutcome::Exited(status.ok()));
                }
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; }, if pending.is_none() => {
                    info!(lease = %lease.id, "Shutdown requested, granting executor a grace window");
                    send_signal(pid, libc::SIGTERM);
                    let grace = GRACE.min(lease.remaining_lock(Utc::now()));
                    kill_at = Some(Instant::now() + grace);
                    pending = Some(WaitOutcome::Interrupted);
                }
                _ = tokio::time::sleep_until(next_renew), if pending.is_none() => {
                    match self.extend(lease).await {
                        ExtendResult::Extended => {
                            lease.record_extension(Utc::now() + chrono::Duration::from_std(lock_ttl).unwrap_or_default());
                            next_renew = renew_instant(lease, lock_ttl);
                        }
                        ExtendResult::Lost => {
                            warn!(lease = %lease.id, "Lock lost, cancelling executor");
                            send_signal(pid, libc::SIGTERM);
                            kill_at = Some(Instant::now() + GRACE);
                            pending = Some(WaitOutcome::LockLost);
                        }
                        ExtendResult::Retry => {
                            next_renew = Instant::now() + EXTEND_RETRY;
                        }
                    }
                }
                _ = tokio::time::sleep_until(hard_deadline), if pending.is_none() => {
                    warn!(lease = %lease.id, "Execution ceiling reached, killing executor");
                    send_signal(pid, libc::SIGKILL);
                    pending = Some(WaitOutcome::DeadlineExceeded);
                }
                _ = tokio::time::sleep_until(kill_deadline), if kill_at.is_some() => {
                    send_signal(pid, libc::SIGKILL);
                    kill_at = None;
                }
            }
        }
    }

    async fn extend(&self, lease: &Lease) -> ExtendResult {
        let request = ExtendLockRequest {
            worker_id: self.config.worker_id.clone(),
            new_duration: self.config.lock_ttl.as_millis() as u64,
        };
        match self.engine.extend_lock(&lease.id, &request).await {
            Ok(ReportStatus::Accepted) => {
                debug!(lease = %lease.id, "Lock extended");
                ExtendResult::Extended
            }
            Ok(ReportStatus::Gone) => ExtendResult::Lost,
            Err(EngineError::Transient { reason }) => {
                warn!(lease = %lease.id, "Transient extend failure: {reason}");
                ExtendResult::Retry
            }
            Err(e) => {
                warn!(lease = %lease.id, "Extend failed: {e}");
                ExtendResult::Retry
            }
        }
    }

    /// Read the outputs file, upload artifacts, and build the report.
    async fn harvest(
        &self,
        lease: &Lease,
        topic: &ResolvedTopic,
        workspace: &Workspace,
        status: std::process::ExitStatus,
        stderr: &[u8],
        redactor: &Redactor,
    ) -> TerminalReport {
        let stderr_tail = redactor.mask(&tail_str(stderr, STDERR_TAIL));

        let outputs = match workspace.read_outputs() {
            Ok(outputs) => outputs,
            Err(e) => {
                return self
                    .failure_report(
                        lease,
                        topic,
                        None,
                        e.to_string(),
                        stderr_tail,
                        BTreeMap::new(),
                        redactor,
                    )
                    .await;
            }
        };

        let mut artifacts: Vec<(String, Vec<u8>)> = Vec::new();
        let file = outputs.unwrap_or_default();
        for (name, artifact) in &file.artifacts {
            match BASE64.decode(&artifact.base64) {
                Ok(bytes) => artifacts.push((name.clone(), bytes)),
                Err(e) => {
                    warn!(lease = %lease.id, artifact = %name, "Skipping artifact with invalid base64: {e}");
                }
            }
        }
        for harvested in workspace.harvest_report_files() {
            if !file.artifacts.contains_key(&harvested.name) {
                artifacts.push((harvested.name, harvested.bytes));
            }
        }
        self.upload_artifacts(lease, artifacts, redactor).await;

        let succeeded = status.success() && file.error_code.is_none();
        if succeeded {
            let mut entries = file.outputs;
            if topic.spec.on_failure == FailurePolicy::Complete {
                // COMPLETE topics always expose the error slots so the
                // model can branch on them uniformly.
                entries.insert("errorCode".to_string(), serde_json::Value::Null);
                entries.insert("errorMessage".to_string(), serde_json::Value::Null);
            }
            return self.complete_report(lease, topic, entries, redactor).await;
        }

        let message = file
            .error_message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if stderr_tail.is_empty() {
                    format!("executor exited with {status}")
                } else {
                    stderr_tail.clone()
                }
            });
        self.failure_report(
            lease,
            topic,
            file.error_code.clone(),
            message,
            stderr_tail,
            file.outputs,
            redactor,
        )
        .await
    }

    /// Build the completion report, diverting oversized outputs to
    /// per-variable uploads.
    async fn complete_report(
        &self,
        lease: &Lease,
        topic: &ResolvedTopic,
        entries: BTreeMap<String, serde_json::Value>,
        redactor: &Redactor,
    ) -> TerminalReport {
        let mut inline: HashMap<String, VariableDto> = HashMap::new();
        for (name, raw) in entries {
            let dto = self.output_to_dto(lease, &name, raw, redactor);
            if codec::wire_len(&dto) > codec::INLINE_VARIABLE_LIMIT {
                if let Some(pid) = &lease.process_instance_id {
                    match self.engine.set_variable(pid, &name, &dto).await {
                        Ok(ReportStatus::Accepted) => {
                            debug!(lease = %lease.id, variable = %name, "Uploaded oversized output");
                            continue;
                        }
                        Ok(ReportStatus::Gone) => {
                            info!(lease = %lease.id, variable = %name, "Process gone during upload");
                            continue;
                        }
                        Err(e) => {
                            warn!(lease = %lease.id, variable = %name, "Oversized output upload failed: {e}");
                            continue;
                        }
                    }
                }
                warn!(
                    lease = %lease.id,
                    variable = %name,
                    "No process instance to upload oversized output to, inlining"
                );
            }
            inline.insert(name, dto);
        }

        let (variables, local_variables) = if topic.spec.process_variables {
            (inline, HashMap::new())
        } else {
            (HashMap::new(), inline)
        };
        TerminalReport::Complete {
            variables,
            local_variables,
        }
    }

    /// Map a non-success outcome through the topic's failure policy.
    #[allow(clippy::too_many_arguments)]
    async fn failure_report(
        &self,
        lease: &Lease,
        topic: &ResolvedTopic,
        error_code: Option<String>,
        error_message: String,
        error_details: String,
        outputs: BTreeMap<String, serde_json::Value>,
        redactor: &Redactor,
    ) -> TerminalReport {
        let error_message = redactor.mask(&error_message);
        match topic.spec.on_failure {
            FailurePolicy::Fail => TerminalReport::Failure {
                error_message,
                error_details: redactor.mask(&error_details),
                retries: self.next_retries(lease),
                retry_timeout: self.config.retry_timeout,
            },
            FailurePolicy::Error => match error_code {
                Some(code) => {
                    let variables = outputs
                        .into_iter()
                        .map(|(name, raw)| {
                            let dto = self.output_to_dto(lease, &name, raw, redactor);
                            (name, dto)
                        })
                        .collect();
                    TerminalReport::BpmnError {
                        error_code: redactor.mask(&code),
                        error_message,
                        variables,
                    }
                }
                // No BPMN error code to route on: fall back to FAIL.
                None => TerminalReport::Failure {
                    error_message,
                    error_details: redactor.mask(&error_details),
                    retries: self.next_retries(lease),
                    retry_timeout: self.config.retry_timeout,
                },
            },
            FailurePolicy::Complete => {
                let mut entries = outputs;
                let code = error_code.unwrap_or_else(|| first_line(&error_message).to_string());
                entries.insert("errorCode".to_string(), serde_json::Value::String(code));
                entries.insert(
                    "errorMessage".to_string(),
                    serde_json::Value::String(error_message),
                );
                self.complete_report(lease, topic, entries, redactor).await
            }
        }
    }

    async fn upload_artifacts(
        &self,
        lease: &Lease,
        artifacts: Vec<(String, Vec<u8>)>,
        redactor: &Redactor,
    ) {
        if artifacts.is_empty() {
            return;
        }
        let Some(pid) = &lease.process_instance_id else {
            warn!(lease = %lease.id, "No process instance id, dropping artifacts");
            return;
        };
        for (name, bytes) in artifacts {
            let bytes = redactor.mask_bytes(bytes);
            let dto = codec::encode(&TypedValue::Bytes(bytes));
            match self.engine.set_variable(pid, &name, &dto).await {
                Ok(ReportStatus::Accepted) => {
                    debug!(lease = %lease.id, artifact = %name, "Uploaded artifact")
                }
                Ok(ReportStatus::Gone) => {
                    info!(lease = %lease.id, artifact = %name, "Process gone during artifact upload")
                }
                // Artifact failures never change the lease outcome.
                Err(e) => warn!(lease = %lease.id, artifact = %name, "Artifact upload failed: {e}"),
            }
        }
    }

    fn output_to_dto(
        &self,
        lease: &Lease,
        name: &str,
        raw: serde_json::Value,
        redactor: &Redactor,
    ) -> VariableDto {
        let typed = codec::from_output(raw).unwrap_or_else(|e| {
            warn!(lease = %lease.id, variable = %name, "Invalid tagged output, reporting as null: {e}");
            TypedValue::Null
        });
        codec::encode(&codec::scrub(typed, redactor))
    }

    fn next_retries(&self, lease: &Lease) -> i32 {
        match lease.retries {
            Some(retries) => (retries - 1).max(0),
            None => self.config.initial_retries,
        }
    }
}

fn build_inputs(lease: &Lease, topic: &ResolvedTopic, secrets: &Secrets) -> serde_json::Value {
    let variables: serde_json::Map<String, serde_json::Value> = lease
        .variables
        .iter()
        .map(|(name, value)| (name.clone(), codec::to_native(value)))
        .collect();
    let secrets: serde_json::Map<String, serde_json::Value> = secrets
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                serde_json::Value::String(value.expose_secret().to_string()),
            )
        })
        .collect();
    serde_json::json!({
        "variables": variables,
        "secrets": secrets,
        "config": {
            "topic": lease.topic,
            "entry": topic.spec.entry,
            "businessKey": lease.business_key,
            "processInstanceId": lease.process_instance_id,
            "processDefinitionKey": lease.process_definition_key,
            "activityId": lease.activity_id,
            "retries": lease.retries,
        },
    })
}

fn search_path(topic: &ResolvedTopic, workspace: &Workspace) -> String {
    let package_dir = workspace.package_dir();
    let mut parts: Vec<String> = topic
        .spec
        .search_path
        .iter()
        .map(|entry| package_dir.join(entry).to_string_lossy().into_owned())
        .collect();
    parts.push(package_dir.to_string_lossy().into_owned());
    parts.push(workspace.work_dir().to_string_lossy().into_owned());
    parts.join(":")
}

/// Next instant at which the remaining lock drops below half the TTL.
fn renew_instant(lease: &Lease, lock_ttl: Duration) -> Instant {
    let remaining = lease.remaining_lock(Utc::now());
    Instant::now() + remaining.saturating_sub(lock_ttl / 2)
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        unsafe { libc::kill(pid as i32, signal) };
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _signal: i32) {}

fn capture(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut reader| {
        tokio::spawn(async move {
            let mut captured = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        // Keep draining past the cap so the pipe never
                        // backs the subprocess up.
                        if captured.len() < MAX_CAPTURE {
                            let take = (MAX_CAPTURE - captured.len()).min(n);
                            captured.extend_from_slice(&chunk[..take]);
                        }
                    }
                }
            }
            captured
        })
    })
}

async fn join_capture(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(handle) => match tokio::time::timeout(CAPTURE_DRAIN, handle).await {
            Ok(captured) => captured.unwrap_or_default(),
            Err(_) => Vec::new(),
        },
        None => Vec::new(),
    }
}

/// UTF-8-safe tail of captured bytes.
fn tail_str(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
