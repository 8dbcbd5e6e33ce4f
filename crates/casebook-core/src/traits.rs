use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::*;

/// Expression evaluator — parses and evaluates a condition or payload
/// expression against a JSON context.
pub trait ExpressionEvaluator: Send + Sync + 'static {
    /// Evaluate `expr` against `context`. An empty expression yields `true`.
    fn evaluate(&self, expr: &str, context: &Map<String, Value>) -> Result<Value>;
}

/// Ticket store — documents holding playbooks and artifacts.
///
/// Every mutating call is a single read-modify-write of one ticket document.
pub trait TicketStore: Send + Sync + 'static {
    /// Insert a new ticket and return its assigned ID.
    fn create_ticket(&self, ticket: Ticket) -> BoxFuture<'_, Result<i64>>;

    fn get_ticket(&self, id: i64) -> BoxFuture<'_, Result<Ticket>>;

    fn list_tickets(&self) -> BoxFuture<'_, Result<Vec<Ticket>>>;

    /// Insert or replace a whole playbook instance.
    fn put_playbook<'a>(
        &'a self,
        ticket_id: i64,
        playbook_id: &'a str,
        playbook: Playbook,
    ) -> BoxFuture<'a, Result<Ticket>>;

    /// Apply one change to one task and return the updated ticket.
    ///
    /// `TaskUpdate::Complete` on a task that is already done fails with
    /// `TaskNotActive` and leaves the ticket untouched.
    fn update_task<'a>(
        &'a self,
        ticket_id: i64,
        playbook_id: &'a str,
        task_id: &'a str,
        update: TaskUpdate,
    ) -> BoxFuture<'a, Result<Ticket>>;

    /// Store an automation result on an artifact, keyed by enrichment name.
    fn enrich_artifact<'a>(
        &'a self,
        ticket_id: i64,
        artifact: &'a str,
        enrichment: Enrichment,
    ) -> BoxFuture<'a, Result<Ticket>>;
}

/// Automation store — static script definitions.
pub trait AutomationStore: Send + Sync + 'static {
    fn put_automation(&self, automation: Automation) -> BoxFuture<'_, Result<()>>;

    fn get_automation<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Automation>>;

    fn list_automations(&self) -> BoxFuture<'_, Result<Vec<Automation>>>;
}

/// Job store — execution records.
pub trait JobStore: Send + Sync + 'static {
    fn create_job(&self, job: Job) -> BoxFuture<'_, Result<()>>;

    fn get_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Job>>;

    fn list_jobs(&self) -> BoxFuture<'_, Result<Vec<Job>>>;

    /// Record the container and replace the log with the preparation output.
    fn set_container<'a>(
        &'a self,
        id: &'a str,
        container: &'a str,
        log: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn set_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, Result<()>>;

    fn append_log<'a>(&'a self, id: &'a str, line: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Terminal transition: store output, `status = "completed"`, not running.
    fn complete_job<'a>(&'a self, id: &'a str, output: Value) -> BoxFuture<'a, Result<()>>;
}

/// Message bus — job requests in, job results out.
pub trait Bus: Send + Sync + 'static {
    fn publish_job(&self, msg: JobMsg) -> Result<()>;

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobMsg>;

    fn publish_result(&self, msg: ResultMsg) -> Result<()>;

    fn subscribe_results(&self) -> broadcast::Receiver<ResultMsg>;
}

/// Container to create for one script run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
}

/// Container runtime — sandbox lifecycle used by the runner.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pull an image, returning the pull progress as text.
    fn pull<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Create (but do not start) a container, returning its ID.
    fn create(&self, spec: ContainerSpec) -> BoxFuture<'_, Result<String>>;

    /// Write a single file into the container filesystem.
    fn copy_file<'a>(
        &'a self,
        container: &'a str,
        path: &'a str,
        content: &'a [u8],
        mode: u32,
    ) -> BoxFuture<'a, Result<()>>;

    fn start<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Follow the container's stderr as it is written.
    fn stream_logs<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<String>>;

    /// Block until the container exits, returning its exit code.
    fn wait<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<i64>>;

    /// Full stdout of an exited container.
    fn stdout<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<String>>;

    fn remove<'a>(&'a self, container: &'a str, force: bool) -> BoxFuture<'a, Result<()>>;
}

/// Source of fresh job identifiers.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
