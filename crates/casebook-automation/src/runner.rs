use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use casebook_core::config::{ApiConfig, AppConfig, SandboxConfig};
use casebook_core::error::{CasebookError, Result, SandboxError};
use casebook_core::traits::{AutomationStore, Bus, ContainerRuntime, ContainerSpec, JobStore};
use casebook_core::types::{Automation, Job, JobMsg, JobOutcome, ResultMsg};

pub const SECRET_API_KEY: &str = "catalyst_apikey";
pub const SECRET_API_URL: &str = "catalyst_apiurl";

/// Path of the script inside every sandbox container.
const SCRIPT_PATH: &str = "/script";
const SCRIPT_MODE: u32 = 0o755;

/// Where a single job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Requested,
    Prepared,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Executes job requests inside throwaway containers and reports results.
pub struct SandboxRunner {
    automations: Arc<dyn AutomationStore>,
    jobs: Arc<dyn JobStore>,
    bus: Arc<dyn Bus>,
    runtime: Arc<dyn ContainerRuntime>,
    api: ApiConfig,
    sandbox: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(
        automations: Arc<dyn AutomationStore>,
        jobs: Arc<dyn JobStore>,
        bus: Arc<dyn Bus>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &AppConfig,
    ) -> Self {
        Self {
            automations,
            jobs,
            bus,
            runtime,
            api: config.api.clone(),
            sandbox: config.sandbox.clone(),
        }
    }

    /// Run one job request to its terminal phase.
    ///
    /// Preparation failures (unknown automation, blank script) close the job
    /// with an error output and are returned without publishing a result.
    /// Failures after that are reported as a `Failed` result instead.
    pub async fn handle_job(&self, mut msg: JobMsg) -> Result<JobPhase> {
        let job_id = msg.id.clone();
        self.jobs.create_job(Job::requested(&msg)).await?;
        debug!(job_id = %job_id, automation = %msg.automation, phase = %JobPhase::Requested, "Job recorded");

        let automation = match self.prepare(&msg.automation).await {
            Ok(automation) => automation,
            Err(e) => {
                warn!(job_id = %job_id, automation = %msg.automation, error = %e, "Job dropped");
                if let Err(store_err) = self
                    .jobs
                    .complete_job(&job_id, json!({ "error": e.to_string() }))
                    .await
                {
                    error!(job_id = %job_id, error = %store_err, "Failed to close dropped job");
                }
                return Err(e);
            }
        };
        debug!(job_id = %job_id, image = %automation.image, phase = %JobPhase::Prepared, "Automation resolved");

        msg.message
            .secrets
            .insert(SECRET_API_KEY.to_string(), self.api.key.clone());
        msg.message
            .secrets
            .insert(SECRET_API_URL.to_string(), self.api.url.clone());
        let message = serde_json::to_string(&msg.message)?;

        let (output, outcome) = compose_output(self.run_script(&job_id, &automation, message).await);
        let phase = match outcome {
            JobOutcome::Succeeded => JobPhase::Completed,
            JobOutcome::Failed => JobPhase::Failed,
        };
        info!(job_id = %job_id, automation = %automation.id, phase = %phase, "Job finished");

        let result = ResultMsg {
            automation: msg.automation.clone(),
            data: output.clone(),
            target: msg.origin.clone(),
            outcome,
        };
        if let Err(e) = self.bus.publish_result(result) {
            error!(job_id = %job_id, error = %e, "Failed to publish job result");
        }
        if let Err(e) = self.jobs.complete_job(&job_id, output).await {
            error!(job_id = %job_id, error = %e, "Failed to persist job completion");
        }

        Ok(phase)
    }

    async fn prepare(&self, automation_id: &str) -> Result<Automation> {
        let automation = self.automations.get_automation(automation_id).await?;
        if automation.script.trim().is_empty() {
            return Err(CasebookError::EmptyScript(automation_id.to_string()));
        }
        Ok(automation)
    }

    /// Pull, create, run and always force-remove the container.
    async fn run_script(&self, job_id: &str, automation: &Automation, message: String) -> Result<String> {
        let pull_log = self.runtime.pull(&automation.image).await?;

        let container = self
            .runtime
            .create(ContainerSpec {
                image: automation.image.clone(),
                cmd: vec![SCRIPT_PATH.to_string(), message],
                working_dir: self.sandbox.workdir.clone(),
            })
            .await?;

        let result = self
            .run_container(job_id, &container, automation, &pull_log)
            .await;

        if let Err(e) = self.runtime.remove(&container, true).await {
            warn!(job_id, container = %container, error = %e, "Failed to remove container");
        }
        result
    }

    async fn run_container(
        &self,
        job_id: &str,
        container: &str,
        automation: &Automation,
        pull_log: &str,
    ) -> Result<String> {
        self.runtime
            .copy_file(container, SCRIPT_PATH, automation.script.as_bytes(), SCRIPT_MODE)
            .await?;

        if let Err(e) = self.jobs.set_container(job_id, container, pull_log).await {
            warn!(job_id, error = %e, "Failed to record container on job");
        }

        self.runtime.start(container).await?;
        if let Err(e) = self.jobs.set_status(job_id, "running").await {
            warn!(job_id, error = %e, "Failed to update job status");
        }
        debug!(job_id, container, phase = %JobPhase::Running, "Container started");

        let stderr = Arc::new(Mutex::new(String::new()));
        let mut log_task = {
            let runtime = self.runtime.clone();
            let jobs = self.jobs.clone();
            let job_id = job_id.to_string();
            let container = container.to_string();
            let buffer = stderr.clone();
            tokio::spawn(async move {
                let mut logs = runtime.stream_logs(&container);
                while let Some(chunk) = logs.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Log stream ended with error");
                            break;
                        }
                    };
                    for line in chunk.split_inclusive('\n') {
                        if let Err(e) = jobs.append_log(&job_id, line).await {
                            warn!(job_id = %job_id, error = %e, "Failed to append job log");
                        }
                        if let Ok(mut buffer) = buffer.lock() {
                            buffer.push_str(line);
                        }
                    }
                }
            })
        };

        let timeout = Duration::from_secs(self.sandbox.timeout_secs);
        let code = match tokio::time::timeout(timeout, self.runtime.wait(container)).await {
            Ok(code) => code,
            Err(_) => {
                log_task.abort();
                warn!(job_id, container, timeout_secs = self.sandbox.timeout_secs, "Container timed out");
                return Err(SandboxError::Timeout {
                    timeout_secs: self.sandbox.timeout_secs,
                }
                .into());
            }
        };

        let grace = Duration::from_millis(self.sandbox.log_grace_ms);
        if tokio::time::timeout(grace, &mut log_task).await.is_err() {
            debug!(job_id, "Log stream still open after exit, dropping the tail");
            log_task.abort();
        }

        let code = code?;
        if code != 0 {
            let stderr = stderr.lock().map(|s| s.clone()).unwrap_or_default();
            return Err(SandboxError::NonZeroExit { code, stderr }.into());
        }

        self.runtime.stdout(container).await
    }
}

/// Turn the script's stdout (or the run error) into the job output.
fn compose_output(run: Result<String>) -> (Value, JobOutcome) {
    match run {
        Ok(stdout) => match serde_json::from_str::<Map<String, Value>>(&stdout) {
            Ok(object) => (Value::Object(object), JobOutcome::Succeeded),
            Err(_) => (json!({ "error": stdout }), JobOutcome::Failed),
        },
        Err(CasebookError::Sandbox(exit @ SandboxError::NonZeroExit { .. })) => {
            (json!({ "error": exit.to_string() }), JobOutcome::Failed)
        }
        Err(CasebookError::Sandbox(inner)) => (
            json!({ "error": format!("error running script: {inner}") }),
            JobOutcome::Failed,
        ),
        Err(other) => (
            json!({ "error": format!("error running script: {other}") }),
            JobOutcome::Failed,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_core::traits::{AutomationStore, JobStore};
    use casebook_core::types::{Message, Origin};
    use futures::future::BoxFuture;
    use casebook_core::EventBus;
    use casebook_memory::SqliteStore;
    use casebook_test_utils::{fixtures, RuntimeCall, Script, ScriptedRuntime};

    struct Harness {
        store: Arc<SqliteStore>,
        bus: Arc<EventBus>,
        runtime: Arc<ScriptedRuntime>,
        runner: SandboxRunner,
    }

    async fn harness(runtime: ScriptedRuntime) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.put_automation(fixtures::hash_automation()).await.unwrap();
        let bus = Arc::new(EventBus::new(16));
        let runtime = Arc::new(runtime);

        let mut config = AppConfig::default();
        config.api.key = "secret-key".into();
        config.sandbox.timeout_secs = 5;
        config.sandbox.log_grace_ms = 50;

        let runner = SandboxRunner::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            runtime.clone(),
            &config,
        );
        Harness {
            store,
            bus,
            runtime,
            runner,
        }
    }

    fn request(id: &str, automation: &str) -> JobMsg {
        JobMsg {
            id: id.into(),
            automation: automation.into(),
            origin: Some(Origin::task(1, "malware", "hash")),
            message: Message {
                payload: json!({"default": "evil"}),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let h = harness(ScriptedRuntime::new(
            Script::success("{\"hash\":\"abc\"}").with_stderr(&["hashing", "done"]),
        ))
        .await;
        let mut results = h.bus.subscribe_results();

        let phase = h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Completed);

        let job = h.store.get_job("j1").await.unwrap();
        assert_eq!(job.output, Some(json!({"hash": "abc"})));
        assert_eq!(job.status, "completed");
        assert!(!job.running);
        assert_eq!(job.container.as_deref(), Some("container-1"));
        assert!(job.log.starts_with("Pulling from docker.io/python:3"));
        assert!(job.log.ends_with("hashing\ndone\n"));

        let result = results.recv().await.unwrap();
        assert_eq!(result.automation, "hash.sha1");
        assert_eq!(result.data, json!({"hash": "abc"}));
        assert_eq!(result.outcome, JobOutcome::Succeeded);
        assert_eq!(result.target, Some(Origin::task(1, "malware", "hash")));
    }

    #[tokio::test]
    async fn test_container_setup() {
        let h = harness(ScriptedRuntime::new(Script::default())).await;
        let _results = h.bus.subscribe_results();
        h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();

        let calls = h.runtime.calls();
        assert_eq!(calls[0], RuntimeCall::Pull(fixtures::PYTHON_IMAGE.into()));

        let spec = &h.runtime.created()[0];
        assert_eq!(spec.image, fixtures::PYTHON_IMAGE);
        assert_eq!(spec.working_dir, "/home");
        assert_eq!(spec.cmd[0], "/script");
        let message: Value = serde_json::from_str(&spec.cmd[1]).unwrap();
        assert_eq!(message["payload"], json!({"default": "evil"}));
        assert_eq!(message["secrets"][SECRET_API_KEY], "secret-key");
        assert_eq!(message["secrets"][SECRET_API_URL], "http://localhost:8000/api");

        assert!(calls.contains(&RuntimeCall::Copy {
            container: "container-1".into(),
            path: "/script".into(),
            content: fixtures::hash_automation().script,
            mode: 0o755,
        }));
        assert_eq!(
            calls.last(),
            Some(&RuntimeCall::Remove {
                container: "container-1".into(),
                force: true
            })
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let h = harness(ScriptedRuntime::new(Script::failure(1, &["Traceback", "KeyError: 'default'"]))).await;
        let mut results = h.bus.subscribe_results();

        let phase = h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Failed);

        let job = h.store.get_job("j1").await.unwrap();
        let error = job.output.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.contains("status code 1"));
        assert!(error.contains("KeyError: 'default'"));
        assert_eq!(job.status, "completed");

        let result = results.recv().await.unwrap();
        assert_eq!(result.outcome, JobOutcome::Failed);
        assert_eq!(h.runtime.removed(), vec!["container-1".to_string()]);
    }

    #[tokio::test]
    async fn test_non_json_stdout() {
        let h = harness(ScriptedRuntime::new(Script::success("hello world\n"))).await;
        let _results = h.bus.subscribe_results();

        let phase = h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Failed);

        let job = h.store.get_job("j1").await.unwrap();
        assert_eq!(job.output, Some(json!({"error": "hello world\n"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_container() {
        let h = harness(ScriptedRuntime::new(Script::hanging())).await;
        let mut results = h.bus.subscribe_results();

        let phase = h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Failed);

        let job = h.store.get_job("j1").await.unwrap();
        assert_eq!(
            job.output,
            Some(json!({"error": "error running script: container timed out after 5s"}))
        );
        assert_eq!(h.runtime.removed(), vec!["container-1".to_string()]);
        assert_eq!(results.recv().await.unwrap().outcome, JobOutcome::Failed);
    }

    #[tokio::test]
    async fn test_pull_failure_skips_container() {
        let h = harness(ScriptedRuntime::new(Script::unpullable())).await;
        let _results = h.bus.subscribe_results();

        let phase = h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Failed);
        assert!(h.runtime.created().is_empty());

        let job = h.store.get_job("j1").await.unwrap();
        let error = job.output.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.starts_with("error running script: image pull failed"));
    }

    #[tokio::test]
    async fn test_empty_script_is_dropped() {
        let h = harness(ScriptedRuntime::new(Script::default())).await;
        h.store
            .put_automation(fixtures::automation("noop", "  \n"))
            .await
            .unwrap();
        let mut results = h.bus.subscribe_results();

        let err = h.runner.handle_job(request("j1", "noop")).await.unwrap_err();
        assert!(matches!(err, CasebookError::EmptyScript(_)));
        assert!(h.runtime.calls().is_empty());
        assert!(results.try_recv().is_err());

        let job = h.store.get_job("j1").await.unwrap();
        assert!(!job.running);
        assert!(job.output.unwrap()["error"].as_str().unwrap().contains("empty script"));
    }

    #[tokio::test]
    async fn test_unknown_automation_is_dropped() {
        let h = harness(ScriptedRuntime::new(Script::default())).await;
        let mut results = h.bus.subscribe_results();

        let err = h.runner.handle_job(request("j1", "nope")).await.unwrap_err();
        assert!(matches!(err, CasebookError::AutomationNotFound(ref id) if id == "nope"));
        assert!(results.try_recv().is_err());
        assert_eq!(h.store.get_job("j1").await.unwrap().status, "completed");
    }

    /// Job store whose log appends always fail.
    struct LoglessJobs(Arc<SqliteStore>);

    impl JobStore for LoglessJobs {
        fn create_job(&self, job: Job) -> BoxFuture<'_, Result<()>> {
            self.0.create_job(job)
        }

        fn get_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Job>> {
            self.0.get_job(id)
        }

        fn list_jobs(&self) -> BoxFuture<'_, Result<Vec<Job>>> {
            self.0.list_jobs()
        }

        fn set_container<'a>(
            &'a self,
            id: &'a str,
            container: &'a str,
            log: &'a str,
        ) -> BoxFuture<'a, Result<()>> {
            self.0.set_container(id, container, log)
        }

        fn set_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, Result<()>> {
            self.0.set_status(id, status)
        }

        fn append_log<'a>(&'a self, _id: &'a str, _line: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(CasebookError::Database("database is locked".into())) })
        }

        fn complete_job<'a>(&'a self, id: &'a str, output: Value) -> BoxFuture<'a, Result<()>> {
            self.0.complete_job(id, output)
        }
    }

    #[tokio::test]
    async fn test_log_append_failure_does_not_fail_job() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.put_automation(fixtures::hash_automation()).await.unwrap();
        let bus = Arc::new(EventBus::new(16));
        let mut results = bus.subscribe_results();
        let runtime = Arc::new(ScriptedRuntime::new(
            Script::success("{\"hash\":\"abc\"}").with_stderr(&["hashing"]),
        ));
        let runner = SandboxRunner::new(
            store.clone(),
            Arc::new(LoglessJobs(store.clone())),
            bus.clone(),
            runtime.clone(),
            &AppConfig::default(),
        );

        let phase = runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Completed);

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.output, Some(json!({"hash": "abc"})));
        assert_eq!(job.status, "completed");
        assert!(!job.log.contains("hashing"));
        assert_eq!(results.recv().await.unwrap().outcome, JobOutcome::Succeeded);
        assert_eq!(runtime.removed(), vec!["container-1".to_string()]);
    }

    #[tokio::test]
    async fn test_job_persisted_without_result_subscriber() {
        let h = harness(ScriptedRuntime::new(Script::success("{\"hash\":\"abc\"}"))).await;

        let phase = h.runner.handle_job(request("j1", "hash.sha1")).await.unwrap();
        assert_eq!(phase, JobPhase::Completed);

        let job = h.store.get_job("j1").await.unwrap();
        assert_eq!(job.output, Some(json!({"hash": "abc"})));
        assert_eq!(job.status, "completed");
        assert!(!job.running);
    }

    #[test]
    fn test_compose_output() {
        let (value, outcome) = compose_output(Ok("[1, 2]".into()));
        assert_eq!(value, json!({"error": "[1, 2]"}));
        assert_eq!(outcome, JobOutcome::Failed);

        let (value, _) = compose_output(Err(SandboxError::NonZeroExit {
            code: 2,
            stderr: "boom\n".into(),
        }
        .into()));
        assert_eq!(value, json!({"error": "container returned status code 2: stderr: boom\n"}));

        let (value, outcome) = compose_output(Ok("{\"ok\": true}".into()));
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(outcome, JobOutcome::Succeeded);
    }
}
