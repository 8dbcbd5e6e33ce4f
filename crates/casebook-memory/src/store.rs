use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use mockable::{Clock, DefaultClock};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use casebook_core::error::{CasebookError, Result};
use casebook_core::traits::{AutomationStore, JobStore, TicketStore};
use casebook_core::types::{Automation, Enrichment, Job, Playbook, TaskUpdate, Ticket};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        doc TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS automations (
        id TEXT PRIMARY KEY,
        doc TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        doc TEXT NOT NULL
    );";

fn db_err(e: impl std::fmt::Display) -> CasebookError {
    CasebookError::Database(e.to_string())
}

fn to_doc<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

/// SQLite-backed store for tickets, automations and jobs.
///
/// Each record is a JSON document; every update is a read-modify-write
/// inside one transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(DefaultClock),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(DefaultClock),
        })
    }

    /// Use `clock` for ticket `modified` timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    fn load_ticket(tx: &Transaction<'_>, id: i64) -> Result<Ticket> {
        let doc: Option<String> = tx
            .query_row("SELECT doc FROM tickets WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        let mut ticket: Ticket = from_doc(&doc.ok_or(CasebookError::TicketNotFound(id))?)?;
        ticket.id = id;
        Ok(ticket)
    }

    /// Apply `change` to one ticket document atomically.
    fn modify_ticket<F>(&self, id: i64, change: F) -> Result<Ticket>
    where
        F: FnOnce(&mut Ticket) -> Result<()>,
    {
        let mut conn = self.conn.lock().map_err(db_err)?;
        let tx = conn.transaction().map_err(db_err)?;

        let mut ticket = Self::load_ticket(&tx, id)?;
        change(&mut ticket)?;
        ticket.modified = self.clock.utc();

        tx.execute(
            "UPDATE tickets SET doc = ?1 WHERE id = ?2",
            params![to_doc(&ticket)?, id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(ticket)
    }

    fn modify_job<F>(&self, id: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut conn = self.conn.lock().map_err(db_err)?;
        let tx = conn.transaction().map_err(db_err)?;

        let doc: Option<String> = tx
            .query_row("SELECT doc FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        let mut job: Job = from_doc(&doc.ok_or_else(|| CasebookError::JobNotFound(id.to_string()))?)?;
        change(&mut job);

        tx.execute(
            "UPDATE jobs SET doc = ?1 WHERE id = ?2",
            params![to_doc(&job)?, id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn list_docs<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<(String, T)>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(&format!("SELECT CAST(id AS TEXT), doc FROM {table} ORDER BY rowid ASC"))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, doc) = row.map_err(db_err)?;
            docs.push((id, from_doc(&doc)?));
        }
        Ok(docs)
    }
}

fn apply_task_update(
    ticket: &mut Ticket,
    playbook_id: &str,
    task_id: &str,
    update: TaskUpdate,
) -> Result<()> {
    let playbook = ticket
        .playbooks
        .get_mut(playbook_id)
        .ok_or_else(|| CasebookError::PlaybookNotFound(playbook_id.to_string()))?;
    let task = playbook
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| CasebookError::TaskNotFound {
            playbook: playbook_id.to_string(),
            task: task_id.to_string(),
        })?;

    match update {
        TaskUpdate::Complete { data, closed } => {
            // done is terminal; a second completion must not overwrite the first
            if task.done {
                return Err(CasebookError::TaskNotActive(format!("{playbook_id}/{task_id}")));
            }
            task.data = Some(data);
            task.done = true;
            task.closed = Some(closed);
        }
        TaskUpdate::Data(data) => task.data = Some(data),
        TaskUpdate::Owner(owner) => task.owner = Some(owner),
    }
    Ok(())
}

impl TicketStore for SqliteStore {
    fn create_ticket(&self, ticket: Ticket) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;

            tx.execute("INSERT INTO tickets (doc) VALUES (?1)", params![to_doc(&ticket)?])
                .map_err(db_err)?;
            let id = tx.last_insert_rowid();

            let mut ticket = ticket;
            ticket.id = id;
            tx.execute(
                "UPDATE tickets SET doc = ?1 WHERE id = ?2",
                params![to_doc(&ticket)?, id],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            debug!(ticket_id = id, name = %ticket.name, "Ticket created");
            Ok(id)
        })
    }

    fn get_ticket(&self, id: i64) -> BoxFuture<'_, Result<Ticket>> {
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            Self::load_ticket(&tx, id)
        })
    }

    fn list_tickets(&self) -> BoxFuture<'_, Result<Vec<Ticket>>> {
        Box::pin(async move {
            Ok(self
                .list_docs::<Ticket>("tickets")?
                .into_iter()
                .map(|(_, ticket)| ticket)
                .collect())
        })
    }

    fn put_playbook<'a>(
        &'a self,
        ticket_id: i64,
        playbook_id: &'a str,
        playbook: Playbook,
    ) -> BoxFuture<'a, Result<Ticket>> {
        Box::pin(async move {
            self.modify_ticket(ticket_id, |ticket| {
                ticket.playbooks.insert(playbook_id.to_string(), playbook);
                Ok(())
            })
        })
    }

    fn update_task<'a>(
        &'a self,
        ticket_id: i64,
        playbook_id: &'a str,
        task_id: &'a str,
        update: TaskUpdate,
    ) -> BoxFuture<'a, Result<Ticket>> {
        Box::pin(async move {
            self.modify_ticket(ticket_id, |ticket| {
                apply_task_update(ticket, playbook_id, task_id, update)
            })
        })
    }

    fn enrich_artifact<'a>(
        &'a self,
        ticket_id: i64,
        artifact: &'a str,
        enrichment: Enrichment,
    ) -> BoxFuture<'a, Result<Ticket>> {
        Box::pin(async move {
            self.modify_ticket(ticket_id, |ticket| {
                let target = ticket
                    .artifacts
                    .iter_mut()
                    .find(|a| a.name == artifact)
                    .ok_or_else(|| CasebookError::ArtifactNotFound(artifact.to_string()))?;
                target.enrichments.insert(enrichment.name.clone(), enrichment);
                Ok(())
            })
        })
    }
}

impl AutomationStore for SqliteStore {
    fn put_automation(&self, automation: Automation) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO automations (id, doc) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
                params![automation.id, to_doc(&automation)?],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_automation<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Automation>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM automations WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;
            from_doc(&doc.ok_or_else(|| CasebookError::AutomationNotFound(id.to_string()))?)
        })
    }

    fn list_automations(&self) -> BoxFuture<'_, Result<Vec<Automation>>> {
        Box::pin(async move {
            Ok(self
                .list_docs::<Automation>("automations")?
                .into_iter()
                .map(|(_, a)| a)
                .collect())
        })
    }
}

impl JobStore for SqliteStore {
    fn create_job(&self, job: Job) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO jobs (id, doc) VALUES (?1, ?2)",
                params![job.id, to_doc(&job)?],
            )
            .map_err(db_err)?;
            debug!(job_id = %job.id, automation = %job.automation, "Job created");
            Ok(())
        })
    }

    fn get_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            from_doc(&doc.ok_or_else(|| CasebookError::JobNotFound(id.to_string()))?)
        })
    }

    fn list_jobs(&self) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            Ok(self
                .list_docs::<Job>("jobs")?
                .into_iter()
                .map(|(_, job)| job)
                .collect())
        })
    }

    fn set_container<'a>(
        &'a self,
        id: &'a str,
        container: &'a str,
        log: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.modify_job(id, |job| {
                job.container = Some(container.to_string());
                job.log = log.to_string();
            })
        })
    }

    fn set_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.modify_job(id, |job| job.status = status.to_string()) })
    }

    fn append_log<'a>(&'a self, id: &'a str, line: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.modify_job(id, |job| job.log.push_str(line)) })
    }

    fn complete_job<'a>(&'a self, id: &'a str, output: serde_json::Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.modify_job(id, |job| {
                job.output = Some(output);
                job.status = "completed".to_string();
                job.running = false;
            })
        })
    }
}
