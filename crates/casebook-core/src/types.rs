use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of playbook step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Human checklist item.
    #[default]
    Task,
    /// Human-filled form described by `schema`.
    Input,
    /// Script run in a sandbox.
    Automation,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Input => "input",
            Self::Automation => "automation",
        };
        f.write_str(s)
    }
}

/// One workflow step of a playbook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TaskType,
    #[serde(default)]
    pub done: bool,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<DateTime<Utc>>,
    /// Recorded outcome of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// AND-join when true, OR-join otherwise.
    #[serde(default)]
    pub join: bool,
    /// Downstream task ID -> condition expression ("" = unconditional).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub next: BTreeMap<String, String>,
    /// Automation argument name -> expression.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: TaskType, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            kind,
            done: false,
            created,
            closed: None,
            data: None,
            join: false,
            next: BTreeMap::new(),
            payload: BTreeMap::new(),
            automation: None,
            owner: None,
            schema: None,
        }
    }

    /// Add an outgoing edge with a condition.
    pub fn with_next(mut self, task_id: impl Into<String>, condition: impl Into<String>) -> Self {
        self.next.insert(task_id.into(), condition.into());
        self
    }

    pub fn with_automation(mut self, automation: impl Into<String>) -> Self {
        self.kind = TaskType::Automation;
        self.automation = Some(automation.into());
        self
    }

    pub fn with_payload(mut self, argument: impl Into<String>, expr: impl Into<String>) -> Self {
        self.payload.insert(argument.into(), expr.into());
        self
    }

    pub fn with_join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn is_automation(&self) -> bool {
        self.kind == TaskType::Automation
    }
}

/// A named task map attached to a ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Playbook {
    pub name: String,
    pub tasks: BTreeMap<String, Task>,
}

/// A task together with its derived state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub active: bool,
    /// Position in the playbook's topological order.
    pub order: usize,
}

/// Read model of a playbook with activation and ordering resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookView {
    pub name: String,
    pub tasks: BTreeMap<String, TaskView>,
}

impl PlaybookView {
    /// Task IDs in display order.
    pub fn ordered_ids(&self) -> Vec<&str> {
        let mut ids: Vec<(&str, usize)> = self
            .tasks
            .iter()
            .map(|(id, view)| (id.as_str(), view.order))
            .collect();
        ids.sort_by_key(|(_, order)| *order);
        ids.into_iter().map(|(id, _)| id).collect()
    }
}

/// Result of an automation run stored on an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Enrichment {
    pub name: String,
    pub data: Value,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enrichments: BTreeMap<String, Enrichment>,
}

impl Artifact {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: None,
            enrichments: BTreeMap::new(),
        }
    }
}

/// Case document owning playbooks and artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub playbooks: BTreeMap<String, Playbook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Ticket {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            status: "open".to_string(),
            created: now,
            modified: now,
            playbooks: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == "open"
    }

    pub fn playbook(&self, playbook_id: &str) -> crate::Result<&Playbook> {
        self.playbooks
            .get(playbook_id)
            .ok_or_else(|| crate::CasebookError::PlaybookNotFound(playbook_id.to_string()))
    }

    pub fn task(&self, playbook_id: &str, task_id: &str) -> crate::Result<&Task> {
        self.playbook(playbook_id)?
            .tasks
            .get(task_id)
            .ok_or_else(|| crate::CasebookError::TaskNotFound {
                playbook: playbook_id.to_string(),
                task: task_id.to_string(),
            })
    }

    pub fn artifact(&self, name: &str) -> crate::Result<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| crate::CasebookError::ArtifactNotFound(name.to_string()))
    }
}

/// An active task together with the ticket and playbook it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskWithContext {
    pub ticket_id: i64,
    pub ticket_name: String,
    pub playbook_id: String,
    pub playbook_name: String,
    pub task_id: String,
    pub task: TaskView,
}

/// Atomic change to one task inside a ticket document.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Record the outcome and close the task.
    Complete {
        data: Value,
        closed: DateTime<Utc>,
    },
    /// Replace the task data without closing it.
    Data(Value),
    Owner(String),
}

/// What triggered a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    TaskOrigin {
        ticket_id: i64,
        playbook_id: String,
        task_id: String,
    },
    ArtifactOrigin { ticket_id: i64, artifact: String },
}

impl Origin {
    pub fn task(ticket_id: i64, playbook_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self::TaskOrigin {
            ticket_id,
            playbook_id: playbook_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn artifact(ticket_id: i64, artifact: impl Into<String>) -> Self {
        Self::ArtifactOrigin {
            ticket_id,
            artifact: artifact.into(),
        }
    }
}

/// Contexts in which an automation may be invoked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutomationType {
    Artifact,
    Playbook,
    Global,
}

/// Reusable script + image definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Automation {
    pub id: String,
    pub image: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "type", default)]
    pub kinds: Vec<AutomationType>,
}

/// One execution of an automation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub automation: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub status: String,
    pub running: bool,
}

impl Job {
    /// A freshly requested job, before any container exists.
    pub fn requested(msg: &JobMsg) -> Self {
        Self {
            id: msg.id.clone(),
            automation: msg.automation.clone(),
            payload: msg.message.payload.clone(),
            origin: msg.origin.clone(),
            container: None,
            log: String::new(),
            output: None,
            status: "created".to_string(),
            running: true,
        }
    }
}

/// Data handed to a script alongside its payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<PlaybookView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<Ticket>,
}

/// The document serialized as the script's single argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MessageContext>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

/// Job request published on the job channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMsg {
    pub id: String,
    pub automation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    pub message: Message,
}

/// Whether a job produced a usable result.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    #[default]
    Succeeded,
    Failed,
}

/// Job result published on the result channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMsg {
    pub automation: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Origin>,
    #[serde(default)]
    pub outcome: JobOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_origin_is_externally_tagged() {
        let origin = Origin::task(7, "phishing", "board");
        let value = serde_json::to_value(&origin).unwrap();
        assert_eq!(
            value,
            json!({"task_origin": {"ticket_id": 7, "playbook_id": "phishing", "task_id": "board"}})
        );

        let parsed: Origin =
            serde_json::from_value(json!({"artifact_origin": {"ticket_id": 1, "artifact": "8.8.8.8"}}))
                .unwrap();
        assert_eq!(parsed, Origin::artifact(1, "8.8.8.8"));
    }

    #[test]
    fn test_task_defaults_from_json() {
        let task: Task = serde_json::from_value(json!({
            "name": "Board involvement?",
            "created": "2024-01-01T00:00:00Z",
            "next": {"escalate": "boardInvolved == true"}
        }))
        .unwrap();
        assert_eq!(task.kind, TaskType::Task);
        assert!(!task.done);
        assert!(!task.join);
        assert_eq!(task.next["escalate"], "boardInvolved == true");
        assert!(task.payload.is_empty());
    }

    #[test]
    fn test_task_type_serializes_lowercase() {
        let value = serde_json::to_value(TaskType::Automation).unwrap();
        assert_eq!(value, json!("automation"));
        assert_eq!(TaskType::Input.to_string(), "input");
    }

    #[test]
    fn test_ticket_lookup_errors() {
        let ticket = Ticket::new("Phishing", Utc::now());
        assert!(matches!(
            ticket.playbook("missing"),
            Err(crate::CasebookError::PlaybookNotFound(_))
        ));
        assert!(matches!(
            ticket.artifact("evil.exe"),
            Err(crate::CasebookError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_playbook_view_ordered_ids() {
        let now = Utc::now();
        let mut tasks = BTreeMap::new();
        for (id, order) in [("b", 0), ("a", 1)] {
            tasks.insert(
                id.to_string(),
                TaskView {
                    task: Task::new(id, TaskType::Task, now),
                    active: false,
                    order,
                },
            );
        }
        let view = PlaybookView {
            name: "x".into(),
            tasks,
        };
        assert_eq!(view.ordered_ids(), vec!["b", "a"]);
    }
}
