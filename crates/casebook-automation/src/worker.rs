use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use casebook_core::traits::Bus;
use casebook_core::types::{JobMsg, ResultMsg};

use crate::feedback::CompletionLoop;
use crate::runner::SandboxRunner;

/// Consumes the job and result channels until cancelled.
///
/// Every message is handled in its own task, so a slow container never holds
/// up results for other jobs.
pub struct Worker {
    runner: Arc<SandboxRunner>,
    completion: Arc<CompletionLoop>,
    jobs: broadcast::Receiver<JobMsg>,
    results: broadcast::Receiver<ResultMsg>,
}

impl Worker {
    /// Subscribes immediately; messages published after this call are seen.
    pub fn new(bus: &dyn Bus, runner: Arc<SandboxRunner>, completion: Arc<CompletionLoop>) -> Self {
        Self {
            runner,
            completion,
            jobs: bus.subscribe_jobs(),
            results: bus.subscribe_results(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Worker started");
        loop {
            tokio::select! {
                job = self.jobs.recv() => match job {
                    Ok(msg) => {
                        let runner = self.runner.clone();
                        tokio::spawn(async move {
                            let job_id = msg.id.clone();
                            if let Err(e) = runner.handle_job(msg).await {
                                warn!(job_id = %job_id, error = %e, "Job not run");
                            }
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Job channel lagged, requests were lost");
                    }
                    Err(RecvError::Closed) => break,
                },
                result = self.results.recv() => match result {
                    Ok(msg) => {
                        let completion = self.completion.clone();
                        tokio::spawn(async move {
                            let automation = msg.automation.clone();
                            if let Err(e) = completion.handle_result(msg).await {
                                error!(automation = %automation, error = %e, "Failed to apply job result");
                            }
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Result channel lagged, results were lost");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => {
                    info!("Worker stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use casebook_core::traits::{AutomationStore, JobStore};
    use casebook_core::{AppConfig, EventBus};
    use casebook_memory::SqliteStore;
    use casebook_playbook::ExprEvaluator;
    use casebook_test_utils::{fixtures, FixedClock, Script, ScriptedRuntime, SequentialIds};
    use serde_json::json;

    use crate::dispatch::Dispatcher;

    #[tokio::test]
    async fn test_worker_runs_adhoc_job() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.put_automation(fixtures::hash_automation()).await.unwrap();
        let bus = Arc::new(EventBus::new(16));
        let evaluator = Arc::new(ExprEvaluator::new());
        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            Arc::new(SequentialIds::new()),
            evaluator.clone(),
        ));

        let runner = Arc::new(SandboxRunner::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            Arc::new(ScriptedRuntime::new(Script::success("{\"hash\":\"abc\"}"))),
            &AppConfig::default(),
        ));
        let completion = Arc::new(CompletionLoop::new(
            store.clone(),
            dispatcher.clone(),
            evaluator,
            Arc::new(FixedClock::default()),
        ));

        let cancel = CancellationToken::new();
        let worker = Worker::new(bus.as_ref(), runner, completion);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let job_id = dispatcher
            .dispatch_adhoc("hash.sha1", json!({"default": "x"}), None)
            .unwrap();

        let mut output = None;
        for _ in 0..100 {
            if let Ok(job) = store.get_job(&job_id).await {
                if !job.running {
                    output = job.output;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(output, Some(json!({"hash": "abc"})));

        cancel.cancel();
        handle.await.ok();
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::default());
        let evaluator = Arc::new(ExprEvaluator::new());
        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            Arc::new(SequentialIds::new()),
            evaluator.clone(),
        ));
        let runner = Arc::new(SandboxRunner::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            Arc::new(ScriptedRuntime::default()),
            &AppConfig::default(),
        ));
        let completion = Arc::new(CompletionLoop::new(
            store,
            dispatcher,
            evaluator,
            Arc::new(FixedClock::default()),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Worker::new(bus.as_ref(), runner, completion).run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
