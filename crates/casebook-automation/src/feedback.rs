use std::sync::Arc;

use mockable::Clock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use casebook_core::error::{CasebookError, Result};
use casebook_core::traits::{ExpressionEvaluator, TicketStore};
use casebook_core::types::{Enrichment, JobOutcome, Origin, ResultMsg, TaskUpdate, Ticket};
use casebook_playbook::{
    evaluate_requirement, is_active, is_task_active, playbook_graph, unique_playbook_id,
    PlaybookTemplate,
};

use crate::dispatch::Dispatcher;

/// Applies task completions and job results to tickets and dispatches the
/// automation tasks they unblock.
pub struct CompletionLoop {
    tickets: Arc<dyn TicketStore>,
    dispatcher: Arc<Dispatcher>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl CompletionLoop {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        dispatcher: Arc<Dispatcher>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            tickets,
            dispatcher,
            evaluator,
            clock,
        }
    }

    /// Close an active task with its outcome, then dispatch the automation
    /// tasks reached through satisfied edges.
    ///
    /// The store refuses to complete a task twice, so of two concurrent
    /// completions only one records its data and dispatches.
    pub async fn complete_task(
        &self,
        ticket_id: i64,
        playbook_id: &str,
        task_id: &str,
        data: Value,
    ) -> Result<Ticket> {
        let ticket = self.tickets.get_ticket(ticket_id).await?;
        let playbook = ticket.playbook(playbook_id)?;
        if !is_task_active(playbook, task_id, self.evaluator.as_ref())? {
            return Err(CasebookError::TaskNotActive(format!("{playbook_id}/{task_id}")));
        }

        let ticket = self
            .tickets
            .update_task(
                ticket_id,
                playbook_id,
                task_id,
                TaskUpdate::Complete {
                    data,
                    closed: self.clock.utc(),
                },
            )
            .await?;
        info!(ticket_id, playbook_id, task_id, "Task completed");

        self.run_next_tasks(&ticket, playbook_id, task_id)?;
        Ok(ticket)
    }

    /// Dispatch every automation target of `task_id` whose edge condition
    /// holds and which is now active. Dispatch failures are logged.
    fn run_next_tasks(&self, ticket: &Ticket, playbook_id: &str, task_id: &str) -> Result<()> {
        let playbook = ticket.playbook(playbook_id)?;
        let task = ticket.task(playbook_id, task_id)?;
        let graph = playbook_graph(playbook)?;

        for (next_id, condition) in &task.next {
            let Some(next) = playbook.tasks.get(next_id) else {
                continue;
            };
            if !next.is_automation() {
                continue;
            }

            match evaluate_requirement(self.evaluator.as_ref(), condition, task.data.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(playbook_id, task = %next_id, "Edge condition not met");
                    continue;
                }
                Err(e) => {
                    warn!(playbook_id, task = %next_id, error = %e, "Edge condition failed to evaluate");
                    continue;
                }
            }
            // A satisfied edge alone is not enough: an AND-join target still
            // waits for its other parents, and a target that is already done
            // (an OR-join reached earlier through another parent) is not run
            // again.
            if !is_active(playbook, next_id, &graph, self.evaluator.as_ref())? {
                debug!(playbook_id, task = %next_id, "Automation task not active yet");
                continue;
            }

            if let Err(e) = self.dispatcher.dispatch_task(ticket, playbook_id, next_id) {
                error!(ticket_id = ticket.id, playbook_id, task = %next_id, error = %e, "Failed to dispatch automation task");
            }
        }
        Ok(())
    }

    /// Apply a job result to whatever triggered the job.
    pub async fn handle_result(&self, result: ResultMsg) -> Result<()> {
        match result.target {
            Some(Origin::TaskOrigin {
                ticket_id,
                playbook_id,
                task_id,
            }) => match result.outcome {
                JobOutcome::Succeeded => {
                    self.complete_task(ticket_id, &playbook_id, &task_id, result.data)
                        .await?;
                    Ok(())
                }
                JobOutcome::Failed => {
                    warn!(
                        ticket_id,
                        playbook_id = %playbook_id,
                        task_id = %task_id,
                        automation = %result.automation,
                        error = %result.data.get("error").unwrap_or(&serde_json::Value::Null),
                        "Automation failed, task left open"
                    );
                    Ok(())
                }
            },
            Some(Origin::ArtifactOrigin { ticket_id, artifact }) => {
                let enrichment = Enrichment {
                    name: result.automation.clone(),
                    data: result.data,
                    created: self.clock.utc(),
                };
                self.tickets
                    .enrich_artifact(ticket_id, &artifact, enrichment)
                    .await?;
                info!(ticket_id, artifact = %artifact, automation = %result.automation, "Artifact enriched");
                Ok(())
            }
            None => {
                debug!(automation = %result.automation, "Result without origin ignored");
                Ok(())
            }
        }
    }

    /// Instantiate a playbook template on a ticket and start its entry task.
    ///
    /// Returns the playbook ID actually used, which gets a numeric suffix when
    /// the requested one is taken.
    pub async fn add_playbook(
        &self,
        ticket_id: i64,
        template: &str,
        playbook_id: Option<&str>,
    ) -> Result<(String, Ticket)> {
        let template = PlaybookTemplate::parse(template)?;
        template.validate()?;

        let ticket = self.tickets.get_ticket(ticket_id).await?;
        let requested = playbook_id
            .map(str::to_string)
            .unwrap_or_else(|| template.default_id());
        let playbook_id = unique_playbook_id(&ticket, &requested);

        let playbook = template.instantiate(&*self.clock);
        let graph = playbook_graph(&playbook)?;
        let ticket = self
            .tickets
            .put_playbook(ticket_id, &playbook_id, playbook)
            .await?;
        info!(ticket_id, playbook_id = %playbook_id, template = %template.name, "Playbook added");

        match graph.root() {
            Ok(root) => {
                if let Err(e) = self.dispatcher.dispatch_task(&ticket, &playbook_id, &root) {
                    error!(ticket_id, playbook_id = %playbook_id, task = %root, error = %e, "Failed to dispatch root task");
                }
            }
            Err(e) => warn!(ticket_id, playbook_id = %playbook_id, error = %e, "No single entry task, nothing dispatched"),
        }

        Ok((playbook_id, ticket))
    }

    /// Manually (re-)run an automation task.
    pub async fn run_task(&self, ticket_id: i64, playbook_id: &str, task_id: &str) -> Result<Option<String>> {
        let ticket = self.tickets.get_ticket(ticket_id).await?;
        self.dispatcher.dispatch_task(&ticket, playbook_id, task_id)
    }

    pub async fn run_artifact(&self, ticket_id: i64, artifact: &str, automation: &str) -> Result<String> {
        let ticket = self.tickets.get_ticket(ticket_id).await?;
        self.dispatcher.dispatch_artifact(&ticket, artifact, automation)
    }

    pub async fn set_task_owner(
        &self,
        ticket_id: i64,
        playbook_id: &str,
        task_id: &str,
        owner: &str,
    ) -> Result<Ticket> {
        self.tickets
            .update_task(ticket_id, playbook_id, task_id, TaskUpdate::Owner(owner.to_string()))
            .await
    }

    /// Store intermediate data on a task without closing it.
    pub async fn set_task_data(
        &self,
        ticket_id: i64,
        playbook_id: &str,
        task_id: &str,
        data: Value,
    ) -> Result<Ticket> {
        self.tickets
            .update_task(ticket_id, playbook_id, task_id, TaskUpdate::Data(data))
            .await
    }
}
