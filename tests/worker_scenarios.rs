//! End-to-end scheduler scenarios against an in-process engine fake and a
//! stub executor script.

#![cfg(unix)]

use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;

use task_bridge::config::WorkerConfig;
use task_bridge::engine::{
    BpmnErrorRequest, CompleteRequest, Engine, EngineApi, ExtendLockRequest, FailureRequest,
    FetchAndLockRequest, LockedTask, ReportStatus,
};
use task_bridge::error::EngineError;
use task_bridge::package::{Package, MANIFEST_FILE};
use task_bridge::registry::TopicRegistry;
use task_bridge::variables::codec::format_engine_date;
use task_bridge::variables::VariableDto;
use task_bridge::worker::Scheduler;

#[derive(Default)]
struct Calls {
    completes: Vec<(String, CompleteRequest)>,
    failures: Vec<(String, FailureRequest)>,
    bpmn_errors: Vec<(String, BpmnErrorRequest)>,
    extends: Vec<(String, u64)>,
    set_variables: Vec<(String, String, VariableDto)>,
    fetch_max_tasks: Vec<usize>,
}

/// Engine fake: scripted fetch responses, recorded calls.
#[derive(Default)]
struct RecordingEngine {
    fetches: Mutex<VecDeque<Vec<LockedTask>>>,
    calls: Mutex<Calls>,
    extend_gone: AtomicBool,
}

impl RecordingEngine {
    fn with_tasks(batches: Vec<Vec<LockedTask>>) -> Arc<Self> {
        Arc::new(Self {
            fetches: Mutex::new(batches.into()),
            ..Self::default()
        })
    }

    fn completes(&self) -> Vec<(String, CompleteRequest)> {
        self.calls.lock().unwrap().completes.clone()
    }

    fn failures(&self) -> Vec<(String, FailureRequest)> {
        self.calls.lock().unwrap().failures.clone()
    }

    fn bpmn_errors(&self) -> Vec<(String, BpmnErrorRequest)> {
        self.calls.lock().unwrap().bpmn_errors.clone()
    }

    fn extend_count(&self) -> usize {
        self.calls.lock().unwrap().extends.len()
    }

    fn set_variables(&self) -> Vec<(String, String, VariableDto)> {
        self.calls.lock().unwrap().set_variables.clone()
    }

    fn report_count(&self) -> usize {
        let calls = self.calls.lock().unwrap();
        calls.completes.len() + calls.failures.len() + calls.bpmn_errors.len()
    }

    fn first_fetch_max_tasks(&self) -> Option<usize> {
        self.calls.lock().unwrap().fetch_max_tasks.first().copied()
    }
}

#[async_trait]
impl EngineApi for RecordingEngine {
    async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
    ) -> Result<Vec<LockedTask>, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .fetch_max_tasks
            .push(request.max_tasks);
        if let Some(batch) = self.fetches.lock().unwrap().pop_front() {
            return Ok(batch);
        }
        // Emulate an empty long poll so the driver does not spin.
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(vec![])
    }

    async fn complete(
        &self,
        task_id: &str,
        request: &CompleteRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .completes
            .push((task_id.to_string(), request.clone()));
        Ok(ReportStatus::Accepted)
    }

    async fn fail(
        &self,
        task_id: &str,
        request: &FailureRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .failures
            .push((task_id.to_string(), request.clone()));
        Ok(ReportStatus::Accepted)
    }

    async fn bpmn_error(
        &self,
        task_id: &str,
        request: &BpmnErrorRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .bpmn_errors
            .push((task_id.to_string(), request.clone()));
        Ok(ReportStatus::Accepted)
    }

    async fn extend_lock(
        &self,
        task_id: &str,
        request: &ExtendLockRequest,
    ) -> Result<ReportStatus, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .extends
            .push((task_id.to_string(), request.new_duration));
        if self.extend_gone.load(Ordering::SeqCst) {
            Ok(ReportStatus::Gone)
        } else {
            Ok(ReportStatus::Accepted)
        }
    }

    async fn set_variable(
        &self,
        process_instance_id: &str,
        name: &str,
        value: &VariableDto,
    ) -> Result<ReportStatus, EngineError> {
        self.calls.lock().unwrap().set_variables.push((
            process_instance_id.to_string(),
            name.to_string(),
            value.clone(),
        ));
        Ok(ReportStatus::Accepted)
    }
}

/// Write a `#!/bin/sh` stub executor. The script sees
/// `$1=packageDir $2=entry $3=inputsPath $4=outputsPath`.
fn write_stub_executor(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("stub-exec.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn write_package(dir: &Path, manifest: &str) -> PathBuf {
    let pkg = dir.join("pkg");
    std::fs::create_dir_all(&pkg).unwrap();
    std::fs::write(pkg.join(MANIFEST_FILE), manifest).unwrap();
    std::fs::write(pkg.join("suite.task"), "say hello").unwrap();
    pkg
}

fn locked_task(
    id: &str,
    topic: &str,
    lock_in: Duration,
    variables: HashMap<String, VariableDto>,
) -> LockedTask {
    let expires = (Utc::now() + chrono::Duration::from_std(lock_in).unwrap())
        .with_timezone(&chrono::FixedOffset::east_opt(0).unwrap());
    LockedTask {
        id: id.to_string(),
        topic_name: topic.to_string(),
        worker_id: Some("w-test".to_string()),
        lock_expiration_time: Some(format_engine_date(&expires)),
        process_instance_id: Some(format!("pi-{id}")),
        process_definition_key: Some("proc".to_string()),
        activity_id: Some("ServiceTask_1".to_string()),
        business_key: Some("bk-1".to_string()),
        variables: Some(variables),
        retries: Some(2),
    }
}

fn string_var(value: &str) -> VariableDto {
    VariableDto {
        kind: Some("String".to_string()),
        value: serde_json::json!(value),
        value_info: None,
    }
}

fn test_config(executable: &Path, max_jobs: usize, lock_ttl: Duration) -> WorkerConfig {
    WorkerConfig {
        worker_id: "w-test".to_string(),
        executable: executable.to_string_lossy().into_owned(),
        max_jobs,
        lock_ttl,
        poll_ttl: Duration::from_millis(200),
        ..WorkerConfig::default()
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    handle: tokio::task::JoinHandle<()>,
}

fn start_worker(
    config: WorkerConfig,
    engine: Arc<RecordingEngine>,
    package_dir: &Path,
) -> Harness {
    let package = Package::load(package_dir).unwrap();
    let registry = Arc::new(TopicRegistry::build(vec![package], &config).unwrap());
    let engine: Engine = engine;
    let scheduler = Arc::new(Scheduler::new(config, engine, registry));
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler.run().await.unwrap();
        })
    };
    Harness { scheduler, handle }
}

impl Harness {
    /// Trigger shutdown and wait for the drain to finish.
    async fn stop(self) {
        self.scheduler.shutdown_handle().trigger();
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("worker did not drain in time")
            .unwrap();
    }
}

async fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

const PLAIN_MANIFEST: &str = "[topics.\"T\"]\nentry = \"main\"\n";

#[tokio::test]
async fn single_success_reports_exactly_one_complete() {
    let dir = tempfile::tempdir().unwrap();
    // Greets the name found in the staged inputs file.
    let executor = write_stub_executor(
        dir.path(),
        r#"name=$(sed -n 's/.*"name":"\([^"]*\)".*/\1/p' "$3")
printf '{"outputs":{"message":"Hello, %s!"}}' "$name" > "$4""#,
    );
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L1",
        "T",
        Duration::from_secs(30),
        HashMap::from([("name".to_string(), string_var("Alice"))]),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 1).await);
    harness.stop().await;

    let completes = engine.completes();
    assert_eq!(completes.len(), 1);
    assert_eq!(engine.report_count(), 1, "exactly one terminal report");

    let (task_id, request) = &completes[0];
    assert_eq!(task_id, "L1");
    let message = &request.local_variables["message"];
    assert_eq!(message.kind.as_deref(), Some("String"));
    assert_eq!(message.value, serde_json::json!("Hello, Alice!"));
    assert!(request.variables.is_empty());
}

#[tokio::test]
async fn error_policy_reports_bpmn_error() {
    let dir = tempfile::tempdir().unwrap();
    let executor = write_stub_executor(
        dir.path(),
        r#"printf '{"outputs":{},"errorCode":"NotFound","errorMessage":"no such user"}' > "$4""#,
    );
    let pkg = write_package(
        dir.path(),
        "[topics.\"T\"]\nentry = \"main\"\non-failure = \"ERROR\"\n",
    );

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L2",
        "T",
        Duration::from_secs(30),
        HashMap::new(),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 1).await);
    harness.stop().await;

    let errors = engine.bpmn_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(engine.report_count(), 1);
    let (task_id, request) = &errors[0];
    assert_eq!(task_id, "L2");
    assert_eq!(request.error_code, "NotFound");
    assert_eq!(request.error_message, "no such user");
    assert!(request.variables.is_empty());
}

#[tokio::test]
async fn long_execution_extends_lock_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let executor = write_stub_executor(
        dir.path(),
        r#"sleep 3
printf '{"outputs":{}}' > "$4""#,
    );
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L3",
        "T",
        Duration::from_secs(1),
        HashMap::new(),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(1)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(12), || engine.report_count() >= 1).await);
    harness.stop().await;

    assert!(
        engine.extend_count() >= 2,
        "expected at least two lock extensions, saw {}",
        engine.extend_count()
    );
    let completes = engine.completes();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].0, "L3");
    assert_eq!(engine.report_count(), 1);
}

#[tokio::test]
async fn lock_lost_terminates_executor_and_abandons_lease() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("sigterm.marker");
    let executor = write_stub_executor(
        dir.path(),
        &format!(
            r#"trap 'kill $CHILD 2>/dev/null; touch {marker}; exit 143' TERM
sleep 5 &
CHILD=$!
wait $CHILD"#,
            marker = marker.display()
        ),
    );
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L4",
        "T",
        Duration::from_secs(1),
        HashMap::new(),
    )]]);
    engine.extend_gone.store(true, Ordering::SeqCst);

    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(1)),
        Arc::clone(&engine),
        &pkg,
    );

    // The first extension attempt comes back Gone and cancels the lease.
    assert!(wait_until(Duration::from_secs(10), || marker.exists()).await);
    assert!(
        wait_until(Duration::from_secs(10), || harness.scheduler.in_flight() == 0).await,
        "in-flight count should drain after the lease is lost"
    );
    harness.stop().await;

    assert_eq!(engine.report_count(), 0, "lost lease is silently abandoned");
}

#[tokio::test]
async fn concurrent_dispatch_saturates_and_withholds_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let executor = write_stub_executor(
        dir.path(),
        r#"sleep 1
printf '{"outputs":{}}' > "$4""#,
    );
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let batch = vec![
        locked_task("C1", "T", Duration::from_secs(30), HashMap::new()),
        locked_task("C2", "T", Duration::from_secs(30), HashMap::new()),
        locked_task("C3", "T", Duration::from_secs(30), HashMap::new()),
    ];
    let engine = RecordingEngine::with_tasks(vec![batch]);
    let harness = start_worker(
        test_config(&executor, 3, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(
        wait_until(Duration::from_secs(5), || harness.scheduler.in_flight() == 3).await,
        "all three leases should run concurrently"
    );
    // The saturating fetch asked for the full window.
    assert_eq!(engine.first_fetch_max_tasks(), Some(3));

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 3).await);
    harness.stop().await;

    assert_eq!(engine.completes().len(), 3);
    let ids: Vec<String> = engine.completes().iter().map(|(id, _)| id.clone()).collect();
    for id in ["C1", "C2", "C3"] {
        assert!(ids.contains(&id.to_string()), "missing completion for {id}");
    }
}

#[tokio::test]
async fn secrets_are_redacted_from_outputs_and_logs() {
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;
        fn make_writer(&'a self) -> Buffer {
            self.clone()
        }
    }

    let logs = Buffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_writer(logs.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempfile::tempdir().unwrap();
    let secrets_path = dir.path().join("secrets.json");
    std::fs::write(&secrets_path, r#"{"api_key": "s3cret"}"#).unwrap();

    // Leaks the secret to stderr and echoes it into an output.
    let executor = write_stub_executor(
        dir.path(),
        r#"key=$(sed -n 's/.*"api_key":"\([^"]*\)".*/\1/p' "$3")
echo "using key $key" >&2
printf '{"outputs":{"message":"key=%s"}}' "$key" > "$4""#,
    );
    let pkg = write_package(
        dir.path(),
        &format!(
            "[topics.\"T\"]\nentry = \"main\"\n\n[secrets.default]\nprovider = \"file\"\npath = \"{}\"\n",
            secrets_path.display()
        ),
    );

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L6",
        "T",
        Duration::from_secs(30),
        HashMap::new(),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 1).await);
    harness.stop().await;

    let completes = engine.completes();
    assert_eq!(completes.len(), 1);
    let message = &completes[0].1.local_variables["message"];
    assert_eq!(message.value, serde_json::json!("key=***"));

    let captured = String::from_utf8_lossy(&logs.0.lock().unwrap()).to_string();
    assert!(
        captured.contains("executor stderr"),
        "stderr should be logged"
    );
    assert!(
        !captured.contains("s3cret"),
        "secret value must not reach the log sink"
    );
}

#[tokio::test]
async fn shutdown_with_no_work_exits_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let executor = write_stub_executor(dir.path(), "exit 0");
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    // Let the driver enter its long poll.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    harness.scheduler.shutdown_handle().trigger();
    tokio::time::timeout(Duration::from_secs(2), harness.handle)
        .await
        .expect("shutdown must interrupt the poll")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.report_count(), 0);
}

#[tokio::test]
async fn runaway_executor_hits_ceiling_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    // exec replaces the shell so the kill reaches the sleeper itself.
    let executor = write_stub_executor(dir.path(), "exec sleep 30");
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L8",
        "T",
        Duration::from_millis(300),
        HashMap::new(),
    )]]);
    // Ceiling is lock_ttl x 10 = 3s.
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_millis(300)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 1).await);
    harness.stop().await;

    let failures = engine.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(engine.report_count(), 1);
    assert!(
        failures[0].1.error_message.contains("deadline"),
        "unexpected message: {}",
        failures[0].1.error_message
    );
}

#[tokio::test]
async fn shutdown_mid_execution_reports_worker_shutting_down() {
    let dir = tempfile::tempdir().unwrap();
    let executor = write_stub_executor(dir.path(), "exec sleep 30");
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L9",
        "T",
        Duration::from_secs(30),
        HashMap::new(),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(
        wait_until(Duration::from_secs(5), || harness.scheduler.in_flight() == 1).await
    );
    harness.stop().await;

    let failures = engine.failures();
    assert_eq!(failures.len(), 1);
    let (task_id, request) = &failures[0];
    assert_eq!(task_id, "L9");
    assert_eq!(request.error_message, "worker shutting down");
    // Retries are passed through unchanged on interruption.
    assert_eq!(request.retries, 2);
}

#[tokio::test]
async fn artifacts_upload_before_terminal_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_b64 = BASE64.encode(b"all 3 tasks passed");
    let executor = write_stub_executor(
        dir.path(),
        &format!(
            r#"printf '{{"outputs":{{}},"artifacts":{{"report.txt":{{"mimeType":"text/plain","base64":"{report_b64}"}}}}}}' > "$4""#
        ),
    );
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L10",
        "T",
        Duration::from_secs(30),
        HashMap::new(),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 1).await);
    harness.stop().await;

    let uploads = engine.set_variables();
    assert_eq!(uploads.len(), 1);
    let (pid, name, dto) = &uploads[0];
    assert_eq!(pid, "pi-L10");
    assert_eq!(name, "report.txt");
    assert_eq!(dto.kind.as_deref(), Some("Bytes"));
    assert_eq!(
        dto.value,
        serde_json::json!(BASE64.encode(b"all 3 tasks passed"))
    );
    assert_eq!(engine.completes().len(), 1);
}

#[tokio::test]
async fn oversized_output_is_uploaded_not_inlined() {
    let dir = tempfile::tempdir().unwrap();
    let executor = write_stub_executor(
        dir.path(),
        r#"big=$(head -c 8192 /dev/zero | tr '\0' 'x')
printf '{"outputs":{"blob":"%s","small":"ok"}}' "$big" > "$4""#,
    );
    let pkg = write_package(dir.path(), PLAIN_MANIFEST);

    let engine = RecordingEngine::with_tasks(vec![vec![locked_task(
        "L11",
        "T",
        Duration::from_secs(30),
        HashMap::new(),
    )]]);
    let harness = start_worker(
        test_config(&executor, 1, Duration::from_secs(30)),
        Arc::clone(&engine),
        &pkg,
    );

    assert!(wait_until(Duration::from_secs(10), || engine.report_count() >= 1).await);
    harness.stop().await;

    let uploads = engine.set_variables();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1, "blob");

    let completes = engine.completes();
    assert_eq!(completes.len(), 1);
    let request = &completes[0].1;
    assert!(request.local_variables.contains_key("small"));
    assert!(
        !request.local_variables.contains_key("blob"),
        "oversized output must not be inlined"
    );
}
