use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{CasebookError, Result};
use crate::traits::Bus;
use crate::types::{JobMsg, ResultMsg};

pub const CHANNEL_JOB: &str = "job";
pub const CHANNEL_RESULT: &str = "result";

/// In-process bus using tokio broadcast channels, one per topic.
/// All subscribers of a topic receive every message.
pub struct EventBus {
    jobs: broadcast::Sender<JobMsg>,
    results: broadcast::Sender<ResultMsg>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (jobs, _) = broadcast::channel(capacity);
        let (results, _) = broadcast::channel(capacity);
        Self { jobs, results }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Bus for EventBus {
    // A send with no subscribers is a lost message, so it is reported.
    fn publish_job(&self, msg: JobMsg) -> Result<()> {
        let id = msg.id.clone();
        let receivers = self
            .jobs
            .send(msg)
            .map_err(|_| CasebookError::PublishFailed {
                channel: CHANNEL_JOB.into(),
                message: "no subscribers".into(),
            })?;
        debug!(job_id = %id, receivers, "Job request published");
        Ok(())
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobMsg> {
        self.jobs.subscribe()
    }

    fn publish_result(&self, msg: ResultMsg) -> Result<()> {
        let automation = msg.automation.clone();
        let receivers = self
            .results
            .send(msg)
            .map_err(|_| CasebookError::PublishFailed {
                channel: CHANNEL_RESULT.into(),
                message: "no subscribers".into(),
            })?;
        debug!(automation = %automation, receivers, "Job result published");
        Ok(())
    }

    fn subscribe_results(&self) -> broadcast::Receiver<ResultMsg> {
        self.results.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobOutcome, Message};

    fn job(id: &str) -> JobMsg {
        JobMsg {
            id: id.into(),
            automation: "hash.sha1".into(),
            origin: None,
            message: Message::default(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_jobs();
        bus.publish_job(job("j1")).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, "j1");
    }

    #[test]
    fn test_publish_without_subscriber_fails() {
        let bus = EventBus::default();
        let err = bus.publish_job(job("j1")).unwrap_err();
        assert!(matches!(err, CasebookError::PublishFailed { ref channel, .. } if channel == "job"));

        let err = bus
            .publish_result(ResultMsg {
                automation: "a".into(),
                data: serde_json::Value::Null,
                target: None,
                outcome: JobOutcome::Succeeded,
            })
            .unwrap_err();
        assert!(matches!(err, CasebookError::PublishFailed { ref channel, .. } if channel == "result"));
    }

    #[tokio::test]
    async fn test_topics_are_separate() {
        let bus = EventBus::new(8);
        let mut results = bus.subscribe_results();
        let _jobs = bus.subscribe_jobs();
        bus.publish_job(job("j1")).unwrap();
        assert!(results.try_recv().is_err());
    }
}
