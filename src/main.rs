use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use casebook_core::traits::{AutomationStore, Bus, JobStore, TicketStore, UuidGenerator};
use casebook_core::types::{Automation, AutomationType, JobMsg, Ticket};
use casebook_core::{AppConfig, CasebookError, Clock, DefaultClock, EventBus, GraphError};

use casebook_automation::{CompletionLoop, Dispatcher, DockerRuntime, SandboxRunner, Worker};
use casebook_memory::SqliteStore;
use casebook_playbook::{playbook_graph, playbook_view, ExprEvaluator, PlaybookTemplate};

/// How often `run` checks whether the playbook has stopped moving.
const IDLE_POLL: Duration = Duration::from_millis(250);
/// Consecutive quiet polls before `run` considers the playbook settled.
const IDLE_POLLS: u32 = 2;

#[derive(Parser)]
#[command(name = "casebook", version, about = "Incident response playbook engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "casebook.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job worker until Ctrl-C
    Worker,
    /// Open a ticket, start a playbook on it and run its automations
    Run {
        /// Template YAML file
        template: PathBuf,
        /// Name of the ticket to open
        #[arg(long, default_value = "casebook run")]
        ticket: String,
        /// JSON object that completes the entry task
        #[arg(long)]
        data: Option<String>,
    },
    /// Validate a playbook template and print its task order
    Check {
        /// Template YAML file
        template: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Manage automation definitions
    Automation {
        #[command(subcommand)]
        action: AutomationAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AutomationAction {
    /// List stored automations
    List,
    /// Add or replace an automation
    Add {
        /// Automation ID, e.g. hash.sha1
        id: String,
        /// Script file copied into the container as /script
        script: PathBuf,
        /// Container image
        #[arg(long, default_value = "docker.io/python:3")]
        image: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("casebook=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "casebook", &mut std::io::stdout());
            Ok(())
        }
        Commands::Check { template } => check_template(&template),
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Automation { action } => {
            let config = load_config(&cli.config)?;
            let store = SqliteStore::open(&config.database_path())?;
            handle_automation(action, &store).await
        }
        Commands::Worker => {
            let config = load_config(&cli.config)?;
            run_worker(config).await
        }
        Commands::Run {
            template,
            ticket,
            data,
        } => {
            let config = load_config(&cli.config)?;
            run_playbook(config, &template, ticket, data.as_deref()).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".casebook").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

/// Stores, bus and services wired against the configured database and Docker.
struct Engine {
    store: Arc<SqliteStore>,
    bus: Arc<EventBus>,
    evaluator: Arc<ExprEvaluator>,
    runner: Arc<SandboxRunner>,
    completion: Arc<CompletionLoop>,
}

impl Engine {
    fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let db_path = config.database_path();
        info!(path = %db_path.display(), "Opening database");
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let bus = Arc::new(EventBus::new(config.bus.capacity));
        let evaluator = Arc::new(ExprEvaluator::new());
        let runtime = Arc::new(DockerRuntime::connect(&config.sandbox)?);

        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            Arc::new(UuidGenerator),
            evaluator.clone(),
        ));
        let runner = Arc::new(SandboxRunner::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            runtime,
            config,
        ));
        let completion = Arc::new(CompletionLoop::new(
            store.clone(),
            dispatcher,
            evaluator.clone(),
            Arc::new(DefaultClock),
        ));

        Ok(Self {
            store,
            bus,
            evaluator,
            runner,
            completion,
        })
    }

    fn worker(&self) -> Worker {
        Worker::new(self.bus.as_ref(), self.runner.clone(), self.completion.clone())
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down worker...");
        cancel_clone.cancel();
    });
    cancel
}

/// Serve job requests published on the in-process bus until Ctrl-C.
///
/// The bus lives in this process, so only playbooks started by an embedding
/// program reach it. `run` drives a playbook from the command line.
async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    let engine = Engine::build(&config)?;
    engine.worker().run(cancel_on_ctrl_c()).await;
    Ok(())
}

async fn run_playbook(
    config: AppConfig,
    template: &Path,
    ticket_name: String,
    data: Option<&str>,
) -> anyhow::Result<()> {
    let yaml = std::fs::read_to_string(template)?;
    let data = data.map(serde_json::from_str::<Value>).transpose()?;
    if let Some(data) = &data {
        if !data.is_object() {
            anyhow::bail!("--data must be a JSON object");
        }
    }

    let engine = Engine::build(&config)?;
    let mut requested = engine.bus.subscribe_jobs();
    let cancel = cancel_on_ctrl_c();
    let worker = tokio::spawn(engine.worker().run(cancel.clone()));

    let ticket_id = engine
        .store
        .create_ticket(Ticket::new(ticket_name, DefaultClock.utc()))
        .await?;
    let (playbook_id, ticket) = engine.completion.add_playbook(ticket_id, &yaml, None).await?;
    info!(ticket_id, playbook_id = %playbook_id, "Playbook started");

    if let Some(data) = data {
        let root = playbook_graph(ticket.playbook(&playbook_id)?)?.root()?;
        engine
            .completion
            .complete_task(ticket_id, &playbook_id, &root, data)
            .await?;
    }

    wait_until_idle(engine.store.as_ref(), &mut requested, &cancel).await;
    cancel.cancel();
    worker.await.ok();

    let ticket = engine.store.get_ticket(ticket_id).await?;
    let view = playbook_view(ticket.playbook(&playbook_id)?, engine.evaluator.as_ref())?;
    println!("ticket {ticket_id}, playbook '{playbook_id}' ({})", view.name);
    for id in view.ordered_ids() {
        let task = &view.tasks[id];
        let state = if task.task.done {
            "done"
        } else if task.active {
            "active"
        } else {
            "waiting"
        };
        println!("  {:>2}. {id} [{}] {state}", task.order + 1, task.task.kind);
        if let Some(data) = &task.task.data {
            println!("      {data}");
        }
    }
    Ok(())
}

/// Wait until every job requested on the bus has finished and no new request
/// arrived for `IDLE_POLLS` polls in a row, or until cancelled.
async fn wait_until_idle(
    jobs: &dyn JobStore,
    requested: &mut broadcast::Receiver<JobMsg>,
    cancel: &CancellationToken,
) {
    let mut pending = BTreeSet::new();
    let mut quiet = 0;
    let mut interval = tokio::time::interval(IDLE_POLL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let mut arrived = false;
        loop {
            match requested.try_recv() {
                Ok(msg) => {
                    debug!(job_id = %msg.id, automation = %msg.automation, "Job requested");
                    pending.insert(msg.id);
                    arrived = true;
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "Missed job requests while waiting");
                }
                Err(_) => break,
            }
        }

        let mut finished = Vec::new();
        for id in &pending {
            // A job the worker has not recorded yet is still pending.
            if let Ok(job) = jobs.get_job(id).await {
                if !job.running {
                    finished.push(id.clone());
                }
            }
        }
        for id in finished {
            pending.remove(&id);
        }

        if pending.is_empty() && !arrived {
            quiet += 1;
            if quiet >= IDLE_POLLS {
                return;
            }
        } else {
            quiet = 0;
        }
    }
}

fn check_template(path: &Path) -> anyhow::Result<()> {
    let yaml = std::fs::read_to_string(path)?;
    let template = PlaybookTemplate::parse(&yaml)?;

    let order = match template.validate() {
        Ok(order) => order,
        Err(CasebookError::Graph(GraphError::Cycle { sorted })) => {
            anyhow::bail!(
                "playbook '{}' has a cycle; ordered before it: [{}]",
                template.name,
                sorted.join(", ")
            );
        }
        Err(e) => return Err(e.into()),
    };

    let mut problems = 0;
    for (id, task) in &template.tasks {
        let expressions = task
            .next
            .iter()
            .map(|(target, expr)| (format!("next.{target}"), expr))
            .chain(task.payload.iter().map(|(arg, expr)| (format!("payload.{arg}"), expr)));
        for (field, expr) in expressions {
            if let Err(e) = ExprEvaluator::validate(expr) {
                problems += 1;
                eprintln!("warning: {id}.{field}: {e}");
            }
        }
    }

    println!("{} ({} tasks)", template.name, order.len());
    for (position, id) in order.iter().enumerate() {
        let kind = template.tasks.get(id).map(|t| t.kind.to_string()).unwrap_or_default();
        println!("  {:>2}. {id} [{kind}]", position + 1);
    }
    if problems > 0 {
        eprintln!("{problems} expression(s) failed to parse");
    }
    Ok(())
}

async fn handle_automation(action: AutomationAction, store: &SqliteStore) -> anyhow::Result<()> {
    match action {
        AutomationAction::List => {
            let automations = store.list_automations().await?;
            if automations.is_empty() {
                println!("No automations stored.");
            }
            for automation in automations {
                println!("  {} ({})", automation.id, automation.image);
            }
        }
        AutomationAction::Add { id, script, image } => {
            let script = std::fs::read_to_string(&script)?;
            store
                .put_automation(Automation {
                    id: id.clone(),
                    image,
                    script,
                    schema: None,
                    kinds: vec![
                        AutomationType::Global,
                        AutomationType::Artifact,
                        AutomationType::Playbook,
                    ],
                })
                .await?;
            println!("Stored automation '{id}'.");
        }
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_core::types::{Job, Message};
    use serde_json::json;

    fn request(id: &str) -> JobMsg {
        JobMsg {
            id: id.into(),
            automation: "hash.sha1".into(),
            origin: None,
            message: Message::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle_waits_for_running_job() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = EventBus::new(8);
        let mut requested = bus.subscribe_jobs();
        bus.publish_job(request("j1")).unwrap();
        store.create_job(Job::requested(&request("j1"))).await.unwrap();

        let finisher = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                store.complete_job("j1", json!({"ok": true})).await.unwrap();
            })
        };

        let started = tokio::time::Instant::now();
        wait_until_idle(store.as_ref(), &mut requested, &CancellationToken::new()).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!store.get_job("j1").await.unwrap().running);
        finisher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle_treats_unrecorded_job_as_pending() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = EventBus::new(8);
        let mut requested = bus.subscribe_jobs();
        bus.publish_job(request("j1")).unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { wait_until_idle(store.as_ref(), &mut requested, &cancel).await })
        };

        tokio::time::sleep(IDLE_POLL * 10).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        waiter.await.unwrap();
    }
}
