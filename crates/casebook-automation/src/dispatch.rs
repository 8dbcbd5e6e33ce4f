use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use casebook_core::error::{CasebookError, Result};
use casebook_core::traits::{Bus, ExpressionEvaluator, IdGenerator};
use casebook_core::types::{JobMsg, Message, MessageContext, Origin, Ticket};
use casebook_playbook::playbook_view;

/// Turns automation tasks, artifacts and manual requests into job requests
/// on the bus. Publishing is fire-and-forget and never deduplicated.
pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    ids: Arc<dyn IdGenerator>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn Bus>,
        ids: Arc<dyn IdGenerator>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self { bus, ids, evaluator }
    }

    /// Publish a job for an automation task. Other task kinds are skipped
    /// and yield `None`.
    pub fn dispatch_task(
        &self,
        ticket: &Ticket,
        playbook_id: &str,
        task_id: &str,
    ) -> Result<Option<String>> {
        let task = ticket.task(playbook_id, task_id)?;
        if !task.is_automation() {
            debug!(playbook_id, task_id, kind = %task.kind, "Not an automation task, nothing to dispatch");
            return Ok(None);
        }
        let automation = task
            .automation
            .clone()
            .ok_or_else(|| CasebookError::AutomationNotFound(format!("{playbook_id}/{task_id}")))?;

        let view = playbook_view(ticket.playbook(playbook_id)?, self.evaluator.as_ref())?;
        let task_view = view
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CasebookError::TaskNotFound {
                playbook: playbook_id.to_string(),
                task: task_id.to_string(),
            })?;

        let mut context = Map::new();
        context.insert("ticket".into(), serde_json::to_value(ticket)?);
        context.insert("playbook".into(), serde_json::to_value(&view)?);
        context.insert("task".into(), serde_json::to_value(&task_view)?);

        let payload = self.generate_payload(&task.payload, &context)?;

        let msg = JobMsg {
            id: self.ids.next_id(),
            automation,
            origin: Some(Origin::task(ticket.id, playbook_id, task_id)),
            message: Message {
                context: Some(MessageContext {
                    artifact: None,
                    playbook: Some(view),
                    task: Some(task_view),
                    ticket: Some(ticket.clone()),
                }),
                payload,
                secrets: BTreeMap::new(),
            },
        };
        self.publish(msg).map(Some)
    }

    /// Run an automation against one artifact of a ticket.
    pub fn dispatch_artifact(&self, ticket: &Ticket, artifact: &str, automation: &str) -> Result<String> {
        let artifact = ticket.artifact(artifact)?.clone();

        let mut payload = Map::new();
        payload.insert("default".into(), Value::String(artifact.name.clone()));

        let msg = JobMsg {
            id: self.ids.next_id(),
            automation: automation.to_string(),
            origin: Some(Origin::artifact(ticket.id, artifact.name.clone())),
            message: Message {
                context: Some(MessageContext {
                    artifact: Some(artifact),
                    ..Default::default()
                }),
                payload: Value::Object(payload),
                secrets: BTreeMap::new(),
            },
        };
        self.publish(msg)
    }

    /// Run an automation with a caller-supplied payload.
    pub fn dispatch_adhoc(&self, automation: &str, payload: Value, origin: Option<Origin>) -> Result<String> {
        let msg = JobMsg {
            id: self.ids.next_id(),
            automation: automation.to_string(),
            origin,
            message: Message {
                context: Some(MessageContext::default()),
                payload,
                secrets: BTreeMap::new(),
            },
        };
        self.publish(msg)
    }

    fn generate_payload(
        &self,
        expressions: &BTreeMap<String, String>,
        context: &Map<String, Value>,
    ) -> Result<Value> {
        let mut payload = Map::new();
        for (argument, expr) in expressions {
            let value = self
                .evaluator
                .evaluate(expr, context)
                .map_err(|e| CasebookError::PayloadGeneration {
                    argument: argument.clone(),
                    message: e.to_string(),
                })?;
            payload.insert(argument.clone(), value);
        }
        Ok(Value::Object(payload))
    }

    fn publish(&self, msg: JobMsg) -> Result<String> {
        let id = msg.id.clone();
        let automation = msg.automation.clone();
        self.bus.publish_job(msg)?;
        info!(job_id = %id, automation = %automation, "Job dispatched");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_core::types::{Artifact, Playbook};
    use casebook_core::EventBus;
    use casebook_playbook::ExprEvaluator;
    use casebook_test_utils::{fixtures, FixedClock, SequentialIds};
    use mockable::Clock;
    use serde_json::json;

    fn dispatcher(bus: Arc<EventBus>) -> Dispatcher {
        Dispatcher::new(bus, Arc::new(SequentialIds::new()), Arc::new(ExprEvaluator::new()))
    }

    fn ticket_with(playbook_id: &str, playbook: Playbook) -> Ticket {
        let mut ticket = Ticket::new("Suspicious mail", FixedClock::default().utc());
        ticket.id = 42;
        ticket.playbooks.insert(playbook_id.to_string(), playbook);
        ticket
    }

    fn complete(playbook: &mut Playbook, task_id: &str, data: Value) {
        let task = playbook.tasks.get_mut(task_id).unwrap();
        task.done = true;
        task.data = Some(data);
    }

    #[tokio::test]
    async fn test_dispatch_task_builds_payload_from_ancestors() {
        let bus = Arc::new(EventBus::new(8));
        let mut jobs = bus.subscribe_jobs();

        let mut playbook = fixtures::malware_playbook();
        complete(&mut playbook, "file-or-hash", json!({"file": "Hash"}));
        complete(&mut playbook, "enter-hash", json!({"hash": "b7a0f3"}));
        let ticket = ticket_with("malware", playbook);

        let id = dispatcher(bus.clone())
            .dispatch_task(&ticket, "malware", "virustotal")
            .unwrap();
        assert_eq!(id.as_deref(), Some("job-1"));

        let msg = jobs.recv().await.unwrap();
        assert_eq!(msg.automation, "vt.hash");
        assert_eq!(msg.message.payload, json!({"default": "b7a0f3"}));
        assert_eq!(msg.origin, Some(Origin::task(42, "malware", "virustotal")));

        let context = msg.message.context.unwrap();
        assert_eq!(context.ticket.unwrap().id, 42);
        assert!(context.task.unwrap().active);
        assert_eq!(context.playbook.unwrap().tasks.len(), 5);
    }

    #[test]
    fn test_dispatch_skips_human_tasks() {
        let bus = Arc::new(EventBus::new(8));
        let _jobs = bus.subscribe_jobs();
        let ticket = ticket_with("malware", fixtures::malware_playbook());

        let id = dispatcher(bus)
            .dispatch_task(&ticket, "malware", "file-or-hash")
            .unwrap();
        assert!(id.is_none());
    }

    #[test]
    fn test_dispatch_unknown_task() {
        let bus = Arc::new(EventBus::new(8));
        let ticket = ticket_with("malware", fixtures::malware_playbook());

        let err = dispatcher(bus)
            .dispatch_task(&ticket, "malware", "sandbox")
            .unwrap_err();
        assert!(matches!(err, CasebookError::TaskNotFound { .. }));
    }

    #[test]
    fn test_payload_error_names_argument() {
        let bus = Arc::new(EventBus::new(8));
        let _jobs = bus.subscribe_jobs();
        let mut playbook = fixtures::malware_playbook();
        playbook
            .tasks
            .get_mut("hash")
            .unwrap()
            .payload
            .insert("broken".into(), "playbook.tasks[".into());
        let ticket = ticket_with("malware", playbook);

        let err = dispatcher(bus)
            .dispatch_task(&ticket, "malware", "hash")
            .unwrap_err();
        assert!(matches!(err, CasebookError::PayloadGeneration { ref argument, .. } if argument == "broken"));
    }

    #[test]
    fn test_publish_without_worker_fails() {
        let bus = Arc::new(EventBus::new(8));
        let err = dispatcher(bus)
            .dispatch_adhoc("hash.sha1", json!({"default": "x"}), None)
            .unwrap_err();
        assert!(matches!(err, CasebookError::PublishFailed { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_artifact() {
        let bus = Arc::new(EventBus::new(8));
        let mut jobs = bus.subscribe_jobs();
        let ticket = ticket_with("malware", fixtures::malware_playbook())
            .with_artifact(Artifact::new("evil.example.com"));

        let id = dispatcher(bus.clone())
            .dispatch_artifact(&ticket, "evil.example.com", "vt.hash")
            .unwrap();

        let msg = jobs.recv().await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.message.payload, json!({"default": "evil.example.com"}));
        assert_eq!(msg.origin, Some(Origin::artifact(42, "evil.example.com")));
        assert_eq!(
            msg.message.context.unwrap().artifact.unwrap().name,
            "evil.example.com"
        );
    }
}
