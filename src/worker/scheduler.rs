//! Fetch-and-lock scheduler.
//!
//! A single driver long-polls the engine and dispatches each locked task
//! onto its own tokio task. The `in_flight` counter is the only
//! serialization point between the driver and runners: incremented before
//! dispatch, decremented after the terminal report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::engine::{
    BpmnErrorRequest, CompleteRequest, Engine, FailureRequest, FetchAndLockRequest, FetchTopic,
    LockedTask, ReportStatus,
};
use crate::error::{EngineError, Result};
use crate::registry::TopicRegistry;
use crate::worker::lease::{Lease, LeaseState, TerminalReport};
use crate::worker::runner::TaskRunner;
use crate::worker::Shutdown;

/// Backoff bounds for fetch errors: 1 s doubling to a 30 s cap, reset on
/// the first successful poll.
const FETCH_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const FETCH_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Retry budget for transient failures of terminal report calls.
const REPORT_ATTEMPTS: u32 = 5;

/// Exponential backoff with a cap.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// The long-poll driver and its shared accounting.
pub struct Scheduler {
    config: WorkerConfig,
    engine: Engine,
    registry: Arc<TopicRegistry>,
    runner: Arc<TaskRunner>,
    in_flight: Arc<AtomicUsize>,
    slot_freed: Arc<Notify>,
    shutdown: Arc<Shutdown>,
}

impl Scheduler {
    pub fn new(config: WorkerConfig, engine: Engine, registry: Arc<TopicRegistry>) -> Self {
        let runner = Arc::new(TaskRunner::new(config.clone(), Arc::clone(&engine)));
        Self {
            config,
            engine,
            registry,
            runner,
            in_flight: Arc::new(AtomicUsize::new(0)),
            slot_freed: Arc::new(Notify::new()),
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// Handle for signal wiring; triggering it starts a graceful drain.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Leases currently being executed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Drive the fetch loop until shutdown and drain complete.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            topics = self.registry.len(),
            max_jobs = self.config.max_jobs,
            "Worker started"
        );

        let mut backoff = Backoff::new(FETCH_BACKOFF_INITIAL, FETCH_BACKOFF_MAX);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            // Wait until there is capacity, or drain out on shutdown.
            loop {
                if self.shutdown.is_shutting_down() {
                    if self.in_flight() == 0 {
                        info!("All leases drained, worker exiting");
                        return Ok(());
                    }
                    self.slot_freed.notified().await;
                    continue;
                }
                if self.in_flight() < self.config.max_jobs {
                    break;
                }
                tokio::select! {
                    _ = self.slot_freed.notified() => {}
                    _ = shutdown_rx.wait_for(|stop| *stop) => {}
                }
            }

            let slots = self.config.max_jobs - self.in_flight();
            let request = self.fetch_request(slots);
            debug!(max_tasks = slots, "Polling for work");

            let poll_result = tokio::select! {
                biased;
                // Dropping the in-flight poll closes its connection; the
                // top of the loop then begins the drain.
                _ = shutdown_rx.wait_for(|stop| *stop) => None,
                result = self.engine.fetch_and_lock(&request) => Some(result),
            };
            let Some(result) = poll_result else {
                continue;
            };
            let tasks = match result {
                Ok(tasks) => {
                    backoff.reset();
                    tasks
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("fetchAndLock failed: {e}; backing off {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.wait_for(|stop| *stop) => {}
                    }
                    continue;
                }
            };

            // An empty long poll is normal; re-poll without backoff.
            for task in tasks {
                self.dispatch(task);
            }
        }
    }

    fn fetch_request(&self, max_tasks: usize) -> FetchAndLockRequest {
        let topics = self
            .registry
            .specs()
            .into_iter()
            .map(|spec| FetchTopic {
                topic_name: spec.topic.clone(),
                lock_duration: self.config.lock_ttl.as_millis() as u64,
                variables: spec.variables.clone(),
                local_variables: !spec.process_variables,
                deserialize_values: false,
            })
            .collect();
        FetchAndLockRequest {
            worker_id: self.config.worker_id.clone(),
            max_tasks,
            async_response_timeout: self.config.poll_ttl.as_millis() as u64,
            topics,
        }
    }

    /// Hand one locked task to its own runner task.
    fn dispatch(&self, task: LockedTask) {
        let task_id = task.id.clone();
        let task_retries = task.retries;

        let Some(topic) = self.registry.get(&task.topic_name) else {
            warn!(
                lease = %task_id,
                topic = %task.topic_name,
                "Fetched task for unregistered topic, failing it back"
            );
            self.spawn_immediate_failure(task_id, task_retries, "no such topic registered");
            return;
        };

        let lease = match Lease::from_locked(task, self.config.lock_ttl) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(lease = %task_id, "Undecodable task variables: {e}");
                self.spawn_immediate_failure(
                    task_id,
                    task_retries,
                    "task variables could not be decoded",
                );
                return;
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        debug!(lease = %lease.id, in_flight = self.in_flight(), "Dispatching lease");

        let runner = Arc::clone(&self.runner);
        let engine = Arc::clone(&self.engine);
        let shutdown = Arc::clone(&self.shutdown);
        let in_flight = Arc::clone(&self.in_flight);
        let slot_freed = Arc::clone(&self.slot_freed);
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            let mut lease = lease;
            let report = runner.execute(&mut lease, &topic, &shutdown).await;
            report_terminal(&engine, &worker_id, &mut lease, report).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            slot_freed.notify_one();
        });
    }

    /// Fail a task back without running it (unknown topic, undecodable
    /// variables). Retries are left unchanged so the engine keeps its
    /// own count.
    fn spawn_immediate_failure(&self, task_id: String, retries: Option<i32>, message: &str) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);
        let slot_freed = Arc::clone(&self.slot_freed);
        let worker_id = self.config.worker_id.clone();
        let retries = retries.unwrap_or(self.config.initial_retries);
        let retry_timeout = self.config.retry_timeout;
        let message = message.to_string();

        tokio::spawn(async move {
            let request = FailureRequest {
                worker_id,
                error_message: message,
                error_details: String::new(),
                retries,
                retry_timeout: retry_timeout.as_millis() as u64,
            };
            match with_retries(|| engine.fail(&task_id, &request)).await {
                Ok(ReportStatus::Accepted) => {}
                Ok(ReportStatus::Gone) => {
                    info!(lease = %task_id, "Lease already reclaimed by engine")
                }
                Err(e) => error!(lease = %task_id, "Failed to report undispatchable task: {e}"),
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            slot_freed.notify_one();
        });
    }
}

/// Issue the single terminal report for a lease.
async fn report_terminal(
    engine: &Engine,
    worker_id: &str,
    lease: &mut Lease,
    report: TerminalReport,
) {
    let target = report.target_state();
    let result = match &report {
        TerminalReport::Abandon => {
            info!(lease = %lease.id, "Lease lost, abandoned without terminal report");
            return;
        }
        TerminalReport::Complete {
            variables,
            local_variables,
        } => {
            let request = CompleteRequest {
                worker_id: worker_id.to_string(),
                variables: variables.clone(),
                local_variables: local_variables.clone(),
            };
            with_retries(|| engine.complete(&lease.id, &request)).await
        }
        TerminalReport::Failure {
            error_message,
            error_details,
            retries,
            retry_timeout,
        } => {
            let request = FailureRequest {
                worker_id: worker_id.to_string(),
                error_message: error_message.clone(),
                error_details: error_details.clone(),
                retries: *retries,
                retry_timeout: retry_timeout.as_millis() as u64,
            };
            with_retries(|| engine.fail(&lease.id, &request)).await
        }
        TerminalReport::BpmnError {
            error_code,
            error_message,
            variables,
        } => {
            let request = BpmnErrorRequest {
                worker_id: worker_id.to_string(),
                error_code: error_code.clone(),
                error_message: error_message.clone(),
                variables: variables.clone(),
            };
            with_retries(|| engine.bpmn_error(&lease.id, &request)).await
        }
    };

    match result {
        Ok(ReportStatus::Accepted) => {
            if let Err(e) = lease.transition_to(target) {
                warn!(lease = %lease.id, "{e}");
            }
            info!(lease = %lease.id, state = %target, "Lease reported");
        }
        Ok(ReportStatus::Gone) => {
            // The lease was reclaimed or reported elsewhere; a completed
            // lifecycle from this worker's point of view.
            info!(lease = %lease.id, "Lease already reclaimed by engine");
            if let Err(e) = lease.transition_to(LeaseState::Lost) {
                warn!(lease = %lease.id, "{e}");
            }
        }
        Err(e) => {
            error!(
                lease = %lease.id,
                "Terminal report rejected: {e}; engine will reclaim via lock expiry"
            );
            if let Err(e) = lease.transition_to(LeaseState::Orphaned) {
                warn!(lease = %lease.id, "{e}");
            }
        }
    }
}

/// Retry a report-shaped call across transient engine errors.
async fn with_retries<F, Fut>(mut call: F) -> std::result::Result<ReportStatus, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<ReportStatus, EngineError>>,
{
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8));
    let mut attempt = 0;
    loop {
        match call().await {
            Err(EngineError::Transient { reason }) if attempt + 1 < REPORT_ATTEMPTS => {
                attempt += 1;
                let delay = backoff.next_delay();
                warn!("Transient engine error ({reason}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
