use std::collections::BTreeMap;

use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use casebook_core::error::{CasebookError, Result};
use casebook_core::types::{Playbook, Task, TaskType, Ticket};

use crate::dag::playbook_graph;

/// A task as written in a playbook template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateTask {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
    /// A bare key (`escalate:`) is an unconditional edge.
    #[serde(
        default,
        deserialize_with = "conditions",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub next: BTreeMap<String, String>,
    #[serde(default)]
    pub join: bool,
}

fn conditions<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<String>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(target, condition)| (target, condition.unwrap_or_default()))
        .collect())
}

/// A reusable playbook definition, parsed from YAML.
///
/// ```yaml
/// name: Malware
/// tasks:
///   file-or-hash:
///     name: Do you have the file or the hash?
///     type: input
///     next:
///       enter-hash: "file == 'Hash'"
///       upload: "file == 'File'"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookTemplate {
    pub name: String,
    #[serde(default)]
    pub tasks: BTreeMap<String, TemplateTask>,
}

impl PlaybookTemplate {
    pub fn parse(yaml: &str) -> Result<Self> {
        let template: Self =
            serde_yaml::from_str(yaml).map_err(|e| CasebookError::Template(e.to_string()))?;

        if template.name.trim().is_empty() {
            return Err(CasebookError::Template("requires template name".into()));
        }
        if template.tasks.is_empty() {
            return Err(CasebookError::Template(format!(
                "playbook '{}' has no tasks",
                template.name
            )));
        }
        for (id, task) in &template.tasks {
            if task.kind == TaskType::Automation && task.automation.is_none() {
                return Err(CasebookError::Template(format!(
                    "automation task '{id}' does not name an automation"
                )));
            }
        }
        Ok(template)
    }

    /// Graph check: every `next` target exists and there is no cycle.
    /// Returns the task order.
    pub fn validate(&self) -> Result<Vec<String>> {
        let playbook = self.instantiate_at(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        let graph = playbook_graph(&playbook)?;
        Ok(graph.toposort()?)
    }

    /// A fresh playbook with every task stamped with the current time.
    pub fn instantiate(&self, clock: &dyn Clock) -> Playbook {
        self.instantiate_at(clock.utc())
    }

    fn instantiate_at(&self, created: chrono::DateTime<chrono::Utc>) -> Playbook {
        let tasks = self
            .tasks
            .iter()
            .map(|(id, t)| {
                let mut task = Task::new(t.name.clone(), t.kind, created);
                task.schema = t.schema.clone();
                task.automation = t.automation.clone();
                task.payload = t.payload.clone();
                task.next = t.next.clone();
                task.join = t.join;
                (id.clone(), task)
            })
            .collect();

        Playbook {
            name: self.name.clone(),
            tasks,
        }
    }

    /// Default instance ID derived from the template name.
    pub fn default_id(&self) -> String {
        kebab_case(&self.name)
    }
}

/// `"Malware Triage"` / `"MalwareTriage"` / `"malware_triage"` -> `"malware-triage"`.
pub fn kebab_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev: Option<char> = None;
    let chars: Vec<char> = input.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            prev = None;
            continue;
        }
        if c.is_uppercase() {
            if let Some(p) = prev {
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                // "malwareTriage" and the "T" in "HTTPServer"
                if p.is_lowercase() || p.is_ascii_digit() || (p.is_uppercase() && next_lower) {
                    out.push('-');
                }
            }
        }
        out.extend(c.to_lowercase());
        prev = Some(c);
    }

    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// First unused playbook ID on the ticket: `id`, then `id0`, `id1`, ...
pub fn unique_playbook_id(ticket: &Ticket, id: &str) -> String {
    if !ticket.playbooks.contains_key(id) {
        return id.to_string();
    }
    (0..)
        .map(|i| format!("{id}{i}"))
        .find(|candidate| !ticket.playbooks.contains_key(candidate))
        .unwrap_or_else(|| id.to_string())
}
