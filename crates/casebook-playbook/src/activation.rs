use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use casebook_core::error::{CasebookError, Result};
use casebook_core::traits::ExpressionEvaluator;
use casebook_core::types::{Playbook, PlaybookView, TaskView, TaskWithContext, Ticket};

use crate::dag::{playbook_graph, Graph};

/// Evaluate an edge condition against a parent task's data.
///
/// An empty condition always holds. Only a boolean `true` result counts as
/// satisfied; any other value is `false`.
pub fn evaluate_requirement(
    evaluator: &dyn ExpressionEvaluator,
    expr: &str,
    data: Option<&Value>,
) -> Result<bool> {
    if expr.trim().is_empty() {
        return Ok(true);
    }

    let empty = Map::new();
    let context = match data {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => &empty,
        Some(other) => {
            warn!(kind = json_kind(other), "Task data is not an object, evaluating against empty context");
            &empty
        }
    };

    Ok(matches!(evaluator.evaluate(expr, context)?, Value::Bool(true)))
}

/// Whether a task can currently be worked on.
///
/// A done task is never active and a task without parents always is. With
/// `join` every parent must be done and satisfy its condition; otherwise one
/// done parent with a satisfied condition is enough. Evaluation errors never
/// reach the caller: they make an AND-join task inactive and are skipped for
/// an OR-join.
pub fn is_active(
    playbook: &Playbook,
    task_id: &str,
    graph: &Graph,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<bool> {
    let task = playbook
        .tasks
        .get(task_id)
        .ok_or_else(|| CasebookError::TaskNotFound {
            playbook: playbook.name.clone(),
            task: task_id.to_string(),
        })?;

    if task.done {
        return Ok(false);
    }

    let parents = graph.parents(task_id);
    if parents.is_empty() {
        return Ok(true);
    }

    if task.join {
        for parent_id in &parents {
            let Some(parent) = playbook.tasks.get(parent_id) else {
                return Ok(false);
            };
            if !parent.done {
                return Ok(false);
            }
            let condition = parent.next.get(task_id).map(String::as_str).unwrap_or("");
            match evaluate_requirement(evaluator, condition, parent.data.as_ref()) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    debug!(task = task_id, parent = %parent_id, error = %e, "Join condition failed");
                    return Ok(false);
                }
            }
        }
        return Ok(true);
    }

    for parent_id in &parents {
        let Some(parent) = playbook.tasks.get(parent_id) else {
            continue;
        };
        if !parent.done {
            continue;
        }
        let condition = parent.next.get(task_id).map(String::as_str).unwrap_or("");
        match evaluate_requirement(evaluator, condition, parent.data.as_ref()) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                debug!(task = task_id, parent = %parent_id, error = %e, "Skipping parent condition");
            }
        }
    }
    Ok(false)
}

/// Build a graph for the playbook and check a single task.
pub fn is_task_active(
    playbook: &Playbook,
    task_id: &str,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<bool> {
    let graph = playbook_graph(playbook)?;
    is_active(playbook, task_id, &graph, evaluator)
}

/// Resolve order and activation for every task of a playbook.
pub fn playbook_view(playbook: &Playbook, evaluator: &dyn ExpressionEvaluator) -> Result<PlaybookView> {
    let graph = playbook_graph(playbook)?;
    let order = graph.toposort()?;

    let mut tasks = BTreeMap::new();
    for (position, task_id) in order.iter().enumerate() {
        let Some(task) = playbook.tasks.get(task_id) else {
            continue;
        };
        let active = is_active(playbook, task_id, &graph, evaluator)?;
        tasks.insert(
            task_id.clone(),
            TaskView {
                task: task.clone(),
                active,
                order: position,
            },
        );
    }

    Ok(PlaybookView {
        name: playbook.name.clone(),
        tasks,
    })
}

/// Every active task across the playbooks of an open ticket.
pub fn active_tasks(ticket: &Ticket, evaluator: &dyn ExpressionEvaluator) -> Result<Vec<TaskWithContext>> {
    if !ticket.is_open() {
        return Ok(Vec::new());
    }

    let mut active = Vec::new();
    for (playbook_id, playbook) in &ticket.playbooks {
        let view = playbook_view(playbook, evaluator)?;
        for task_id in view.ordered_ids() {
            let Some(task) = view.tasks.get(task_id) else {
                continue;
            };
            if task.active {
                active.push(TaskWithContext {
                    ticket_id: ticket.id,
                    ticket_name: ticket.name.clone(),
                    playbook_id: playbook_id.clone(),
                    playbook_name: playbook.name.clone(),
                    task_id: task_id.to_string(),
                    task: task.clone(),
                });
            }
        }
    }
    Ok(active)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
