use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;

/// Format a timestamp the way every table stores it. Fixed width, so the
/// text sorts chronologically.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Async-safe handle to the studio database.
///
/// Wraps `StudioDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StudioDb>>,
}

impl DbHandle {
    pub fn new(db: StudioDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StudioDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StudioDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Everything written by one submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub project: Project,
    pub message: Message,
    pub job: JobEvent,
}

/// Result of recording agent output for a job.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Created(Message),
    /// The job already recorded a message (redelivered event).
    AlreadyRecorded(Message),
}

impl AppendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Created(m) | Self::AlreadyRecorded(m) => m,
        }
    }
}

pub struct StudioDb {
    conn: Connection,
}

impl StudioDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    role TEXT NOT NULL,
                    type TEXT NOT NULL,
                    job_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS fragments (
                    id TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
                    sandbox_url TEXT,
                    title TEXT NOT NULL DEFAULT '',
                    files TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS job_events (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    available_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, created_at);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_agent_job
                    ON messages(job_id) WHERE job_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_job_events_status ON job_events(status, available_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Submission ────────────────────────────────────────────────────

    /// Persist a project, its initiating USER message and the job event in
    /// one transaction. Either all three rows exist afterwards or none do.
    pub fn submit(
        &self,
        name: &str,
        value: &str,
        event_name: &str,
        payload_for: impl FnOnce(&str) -> serde_json::Value,
    ) -> Result<Submission> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin submission transaction")?;

        let project_id = Uuid::new_v4().to_string();
        let now = now_ts();
        tx.execute(
            "INSERT INTO projects (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![project_id, name, now],
        )
        .context("Failed to insert project")?;

        let message_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages (id, project_id, content, role, type, job_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            params![
                message_id,
                project_id,
                value,
                MessageRole::User.as_str(),
                MessageType::Result.as_str(),
                now
            ],
        )
        .context("Failed to insert user message")?;

        let job = self.insert_job(event_name, &payload_for(&project_id), &now)?;

        tx.commit().context("Failed to commit submission")?;

        let project = self
            .get_project(&project_id)?
            .context("Project not found after insert")?;
        let message = self
            .get_message(&message_id)?
            .context("Message not found after insert")?;
        Ok(Submission {
            project,
            message,
            job,
        })
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    /// All projects, most recently updated first.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, created_at, updated_at FROM projects
                 ORDER BY updated_at DESC, rowid DESC",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project_detail(&self, id: &str) -> Result<Option<ProjectDetail>> {
        let Some(project) = self.get_project(id)? else {
            return Ok(None);
        };
        let messages = self.list_messages(id)?;
        Ok(Some(ProjectDetail { project, messages }))
    }

    // ── Messages ──────────────────────────────────────────────────────

    const MESSAGE_COLUMNS: &'static str = "m.id, m.project_id, m.content, m.role, m.type, m.job_id, m.created_at,
         f.id, f.sandbox_url, f.title, f.files, f.created_at";

    /// Messages of a project in creation order, each with its fragment.
    pub fn list_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages m LEFT JOIN fragments f ON f.message_id = m.id
             WHERE m.project_id = ?1 ORDER BY m.created_at, m.rowid",
            Self::MESSAGE_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![project_id], MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let r = row.context("Failed to read message row")?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM messages m LEFT JOIN fragments f ON f.message_id = m.id WHERE m.id = ?1",
            Self::MESSAGE_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id], MessageRow::from_row)
            .optional()
            .context("Failed to query message")?;
        row.map(MessageRow::into_message).transpose()
    }

    pub fn get_message_for_job(&self, job_id: &str) -> Result<Option<Message>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM messages WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up message for job")?;
        match id {
            Some(id) => self.get_message(&id),
            None => Ok(None),
        }
    }

    /// Append an AGENT message (with an optional fragment) to a project.
    ///
    /// When `job_id` is set the write is idempotent per job: a second call
    /// for the same job returns the message recorded the first time.
    pub fn append_agent_message(
        &self,
        project_id: &str,
        job_id: Option<&str>,
        content: &str,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
    ) -> Result<AppendOutcome> {
        if let Some(job_id) = job_id {
            if let Some(existing) = self.get_message_for_job(job_id)? {
                return Ok(AppendOutcome::AlreadyRecorded(existing));
            }
        }

        if self.get_project(project_id)?.is_none() {
            anyhow::bail!("Project {} not found", project_id);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin append transaction")?;
        let now = now_ts();
        let message_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages (id, project_id, content, role, type, job_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message_id,
                project_id,
                content,
                MessageRole::Agent.as_str(),
                message_type.as_str(),
                job_id,
                now
            ],
        )
        .context("Failed to insert agent message")?;

        if let Some(fragment) = fragment {
            let files =
                serde_json::to_string(&fragment.files).context("Failed to encode fragment files")?;
            tx.execute(
                "INSERT INTO fragments (id, message_id, sandbox_url, title, files, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    message_id,
                    fragment.sandbox_url,
                    fragment.title,
                    files,
                    now
                ],
            )
            .context("Failed to insert fragment")?;
        }

        tx.execute(
            "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
            params![now, project_id],
        )
        .context("Failed to touch project")?;
        tx.commit().context("Failed to commit agent message")?;

        let message = self
            .get_message(&message_id)?
            .context("Message not found after insert")?;
        Ok(AppendOutcome::Created(message))
    }

    // ── Job events ────────────────────────────────────────────────────

    fn insert_job(&self, name: &str, payload: &serde_json::Value, now: &str) -> Result<JobEvent> {
        let id = Uuid::new_v4().to_string();
        let payload_text = serde_json::to_string(payload).context("Failed to encode job payload")?;
        self.conn
            .execute(
                "INSERT INTO job_events (id, name, payload, status, attempts, available_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?4, ?4)",
                params![id, name, payload_text, now],
            )
            .context("Failed to insert job event")?;
        self.get_job(&id)?.context("Job event not found after insert")
    }

    /// Queue a standalone event outside of a submission.
    #[cfg(test)]
    pub(crate) fn enqueue_job(&self, name: &str, payload: &serde_json::Value) -> Result<JobEvent> {
        self.insert_job(name, payload, &now_ts())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobEvent>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, payload, status, attempts, last_error, available_at, created_at, updated_at
                 FROM job_events WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job event")?;
        row.map(JobRow::into_job).transpose()
    }

    /// Events whose payload references the given project, oldest first.
    pub fn jobs_for_project(&self, project_id: &str) -> Result<Vec<JobEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, payload, status, attempts, last_error, available_at, created_at, updated_at
                 FROM job_events WHERE json_extract(payload, '$.projectId') = ?1
                 ORDER BY created_at, rowid",
            )
            .context("Failed to prepare jobs_for_project")?;
        let rows = stmt
            .query_map(params![project_id], JobRow::from_row)
            .context("Failed to query job events")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn count_jobs(&self, status: JobStatus) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM job_events WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count job events")
    }

    /// Lease the oldest deliverable event.
    ///
    /// Deliverable means `queued` and due, or `running` with an expired
    /// lease (its worker died or timed out). The lease expiry is stored in
    /// `available_at` while the event is running.
    ///
    /// An expired lease that has already used `max_attempts` is not leased
    /// again: it is moved to `failed` and returned in that state so the
    /// caller can record the terminal failure.
    pub fn claim_next_job(
        &self,
        now: &str,
        lease_until: &str,
        max_attempts: u32,
    ) -> Result<Option<JobEvent>> {
        self.claim_where(None, now, lease_until, max_attempts)
    }

    /// Like [`claim_next_job`](Self::claim_next_job), restricted to one event.
    pub fn claim_job(
        &self,
        id: &str,
        now: &str,
        lease_until: &str,
        max_attempts: u32,
    ) -> Result<Option<JobEvent>> {
        self.claim_where(Some(id), now, lease_until, max_attempts)
    }

    fn claim_where(
        &self,
        only: Option<&str>,
        now: &str,
        lease_until: &str,
        max_attempts: u32,
    ) -> Result<Option<JobEvent>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin claim transaction")?;
        let next: Option<(String, String, u32)> = tx
            .query_row(
                "SELECT id, status, attempts FROM job_events
                 WHERE status IN ('queued', 'running') AND available_at <= ?1
                   AND (?2 IS NULL OR id = ?2)
                 ORDER BY created_at, rowid LIMIT 1",
                params![now, only],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to select next job event")?;
        let Some((id, status, attempts)) = next else {
            return Ok(None);
        };

        if status == JobStatus::Running.as_str() && attempts >= max_attempts {
            tx.execute(
                "UPDATE job_events SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![
                    format!("lease expired after {} attempts", attempts),
                    now,
                    id
                ],
            )
            .context("Failed to expire job event")?;
        } else {
            tx.execute(
                "UPDATE job_events SET status = 'running', attempts = attempts + 1,
                     available_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![lease_until, now, id],
            )
            .context("Failed to lease job event")?;
        }
        tx.commit().context("Failed to commit claim")?;
        self.get_job(&id)
    }

    pub fn complete_job(&self, id: &str) -> Result<JobEvent> {
        let now = now_ts();
        self.conn
            .execute(
                "UPDATE job_events SET status = 'completed', last_error = NULL, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to complete job event")?;
        self.get_job(id)?.context("Job event not found after completion")
    }

    /// Record a failed attempt. The event goes back to `queued` at
    /// `retry_at` until `max_attempts` is reached, then becomes `failed`.
    pub fn fail_job(
        &self,
        id: &str,
        error: &str,
        max_attempts: u32,
        retry_at: &str,
    ) -> Result<JobEvent> {
        let now = now_ts();
        self.conn
            .execute(
                "UPDATE job_events SET
                    status = CASE WHEN attempts >= ?1 THEN 'failed' ELSE 'queued' END,
                    available_at = CASE WHEN attempts >= ?1 THEN available_at ELSE ?2 END,
                    last_error = ?3,
                    updated_at = ?4
                 WHERE id = ?5",
                params![max_attempts, retry_at, error, now, id],
            )
            .context("Failed to record job failure")?;
        self.get_job(id)?.context("Job event not found after failure")
    }
}

/// Intermediate row struct for messages joined with fragments.
struct MessageRow {
    id: String,
    project_id: String,
    content: String,
    role: String,
    message_type: String,
    job_id: Option<String>,
    created_at: String,
    fragment_id: Option<String>,
    sandbox_url: Option<String>,
    title: Option<String>,
    files: Option<String>,
    fragment_created_at: Option<String>,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            content: row.get(2)?,
            role: row.get(3)?,
            message_type: row.get(4)?,
            job_id: row.get(5)?,
            created_at: row.get(6)?,
            fragment_id: row.get(7)?,
            sandbox_url: row.get(8)?,
            title: row.get(9)?,
            files: row.get(10)?,
            fragment_created_at: row.get(11)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let role = MessageRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message role")?;
        let message_type = MessageType::from_str(&self.message_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message type")?;
        let fragment = match self.fragment_id {
            Some(fragment_id) => {
                let files: FileCollection =
                    serde_json::from_str(self.files.as_deref().unwrap_or("{}"))
                        .context("Failed to parse fragment files JSON")?;
                Some(Fragment {
                    id: fragment_id,
                    message_id: self.id.clone(),
                    sandbox_url: self.sandbox_url,
                    title: self.title.unwrap_or_default(),
                    files,
                    created_at: self.fragment_created_at.unwrap_or_default(),
                })
            }
            None => None,
        };
        Ok(Message {
            id: self.id,
            project_id: self.project_id,
            content: self.content,
            role,
            message_type,
            job_id: self.job_id,
            created_at: self.created_at,
            fragment,
        })
    }
}

/// Intermediate row struct for job_events.
struct JobRow {
    id: String,
    name: String,
    payload: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    available_at: String,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            available_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<JobEvent> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let payload =
            serde_json::from_str(&self.payload).context("Failed to parse job payload JSON")?;
        Ok(JobEvent {
            id: self.id,
            name: self.name,
            payload,
            status,
            attempts: self.attempts,
            last_error: self.last_error,
            available_at: self.available_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
