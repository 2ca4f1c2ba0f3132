//! JobConsumer and the worker loop that feeds it from the durable queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use super::agent::{AgentProvider, AgentSpec, OutputParser, format_prompt};
use super::db::{AppendOutcome, DbHandle};
use super::models::{
    CODE_AGENT_RUN_EVENT, JobEvent, JobPayload, JobStatus, Message, MessageType,
};
use super::queue::{FailureDisposition, JobQueue};
use super::ws::{WsMessage, broadcast_message};
use crate::errors::StudioError;

/// Content of the ERROR message recorded when a job runs out of attempts.
pub const TERMINAL_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs one `code-agent/run` event: prompt the agent, persist its output.
#[derive(Clone)]
pub struct JobConsumer {
    db: DbHandle,
    agents: Arc<dyn AgentProvider>,
    spec: AgentSpec,
    run_timeout: Duration,
    events: Option<broadcast::Sender<WsMessage>>,
}

impl JobConsumer {
    pub fn new(db: DbHandle, agents: Arc<dyn AgentProvider>, spec: AgentSpec) -> Self {
        Self {
            db,
            agents,
            spec,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            events: None,
        }
    }

    /// Upper bound on a single agent run.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_events(mut self, tx: broadcast::Sender<WsMessage>) -> Self {
        self.events = Some(tx);
        self
    }

    fn payload(job: &JobEvent) -> Result<JobPayload, StudioError> {
        if job.name != CODE_AGENT_RUN_EVENT {
            return Err(StudioError::InvalidJob {
                job_id: job.id.clone(),
                reason: format!("no handler for event '{}'", job.name),
            });
        }
        serde_json::from_value(job.payload.clone()).map_err(|e| StudioError::InvalidJob {
            job_id: job.id.clone(),
            reason: format!("malformed payload: {}", e),
        })
    }

    /// Handle one delivery of an event.
    ///
    /// A redelivered event whose message already exists returns
    /// `AlreadyRecorded` without invoking the agent again. Agent failures
    /// are returned, never swallowed, so the queue can retry.
    ///
    /// Only the agent run is bounded by the run timeout. Once it returns,
    /// the result is written to completion, so a timed-out run never leaves
    /// a write in flight.
    pub async fn handle(&self, job: &JobEvent) -> Result<AppendOutcome, StudioError> {
        let payload = Self::payload(job)?;
        let project_id = payload.project_id.clone();

        let (exists, existing) = {
            let (project_id, job_id) = (project_id.clone(), job.id.clone());
            self.db
                .call(move |db| {
                    let exists = db.get_project(&project_id)?.is_some();
                    Ok((exists, db.get_message_for_job(&job_id)?))
                })
                .await
                .map_err(StudioError::Database)?
        };
        if let Some(message) = existing {
            tracing::info!(job_id = %job.id, project_id = %project_id, "job already recorded, skipping");
            return Ok(AppendOutcome::AlreadyRecorded(message));
        }
        if !exists {
            return Err(StudioError::not_found(project_id));
        }

        let agent = self
            .agents
            .create(&self.spec)
            .map_err(|e| StudioError::JobExecution {
                job_id: job.id.clone(),
                message: format!("agent construction failed: {:#}", e),
            })?;

        let prompt = format_prompt(&payload.value);
        tracing::debug!(job_id = %job.id, agent = %agent.spec().name, model = %agent.spec().model, "invoking agent");
        let run = match tokio::time::timeout(self.run_timeout, agent.run(&prompt)).await {
            Ok(run) => run.map_err(|e| StudioError::JobExecution {
                job_id: job.id.clone(),
                message: format!("{:#}", e),
            })?,
            Err(_) => {
                return Err(StudioError::JobExecution {
                    job_id: job.id.clone(),
                    message: format!("agent run timed out after {:?}", self.run_timeout),
                });
            }
        };

        let parsed = OutputParser::parse(&run.output);
        let job_id = job.id.clone();
        let outcome = self
            .db
            .call(move |db| {
                db.append_agent_message(
                    &project_id,
                    Some(&job_id),
                    &parsed.content,
                    MessageType::Result,
                    parsed.fragment.as_ref(),
                )
            })
            .await
            .map_err(StudioError::Database)?;

        if let AppendOutcome::Created(message) = &outcome {
            tracing::info!(
                job_id = %job.id,
                project_id = %message.project_id,
                files = message.fragment.as_ref().map(|f| f.files.len()).unwrap_or(0),
                "agent result recorded"
            );
            self.announce(message);
        }
        Ok(outcome)
    }

    /// Record the terminal failure of a job as an AGENT ERROR message.
    ///
    /// Returns `None` when the event does not reference a project.
    pub async fn record_failure(&self, job: &JobEvent) -> Result<Option<Message>, StudioError> {
        let Ok(payload) = Self::payload(job) else {
            return Ok(None);
        };
        let job_id = job.id.clone();
        let project_id = payload.project_id;
        let outcome = self
            .db
            .call(move |db| {
                if db.get_project(&project_id)?.is_none() {
                    return Ok(None);
                }
                db.append_agent_message(
                    &project_id,
                    Some(&job_id),
                    TERMINAL_FAILURE_MESSAGE,
                    MessageType::Error,
                    None,
                )
                .map(Some)
            })
            .await
            .map_err(StudioError::Database)?;

        Ok(outcome.map(|outcome| {
            if let AppendOutcome::Created(message) = &outcome {
                self.announce(message);
            }
            outcome.message().clone()
        }))
    }

    fn announce(&self, message: &Message) {
        if let Some(tx) = &self.events {
            broadcast_message(
                tx,
                WsMessage::MessageCreated {
                    message: message.clone(),
                },
            );
        }
    }

    fn announce_failure(&self, job: &JobEvent, disposition: &FailureDisposition, error: &str) {
        let Some(tx) = &self.events else {
            return;
        };
        let project_id = job
            .payload
            .get("projectId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let msg = match *disposition {
            FailureDisposition::Retrying { attempts } => WsMessage::JobRetrying {
                job_id: job.id.clone(),
                project_id,
                attempts,
                error: error.to_string(),
            },
            FailureDisposition::Exhausted { attempts } => WsMessage::JobFailed {
                job_id: job.id.clone(),
                project_id,
                attempts,
                error: error.to_string(),
            },
        };
        broadcast_message(tx, msg);
    }
}

/// What one worker pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    Completed { job_id: String },
    Retrying { job_id: String, attempts: u32 },
    Failed { job_id: String, attempts: u32 },
}

/// Pulls events from the queue and runs them through a `JobConsumer`.
#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    consumer: JobConsumer,
    poll_interval: Duration,
}

impl Worker {
    /// The consumer's run timeout is tied to the queue lease, so an event is
    /// never redelivered while its agent is still running.
    pub fn new(queue: JobQueue, consumer: JobConsumer, poll_interval: Duration) -> Self {
        let consumer = consumer.with_run_timeout(queue.policy().visibility_timeout);
        Self {
            queue,
            consumer,
            poll_interval,
        }
    }

    /// Claim and process at most one event. `Ok(None)` when nothing is due.
    pub async fn run_once(&self) -> anyhow::Result<Option<JobReport>> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(Some(self.expire(job).await));
        }
        self.process(job).await.map(Some)
    }

    /// An event whose lease lapsed on its final attempt. Its worker never
    /// reported back, so the failure is recorded here.
    async fn expire(&self, job: JobEvent) -> JobReport {
        let message = job
            .last_error
            .clone()
            .unwrap_or_else(|| "lease expired".to_string());
        tracing::error!(job_id = %job.id, attempts = job.attempts, error = %message, "job lease expired, giving up");
        let disposition = FailureDisposition::Exhausted {
            attempts: job.attempts,
        };
        self.consumer.announce_failure(&job, &disposition, &message);
        if let Err(e) = self.consumer.record_failure(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to record failure message");
        }
        JobReport::Failed {
            job_id: job.id,
            attempts: job.attempts,
        }
    }

    async fn process(&self, job: JobEvent) -> anyhow::Result<JobReport> {
        tracing::debug!(job_id = %job.id, attempt = job.attempts, "job claimed");

        let error = match self.consumer.handle(&job).await {
            Ok(_) => {
                self.queue.complete(&job.id).await?;
                return Ok(JobReport::Completed { job_id: job.id });
            }
            Err(e) => e,
        };

        let message = error.to_string();
        let disposition = if error.is_retryable() {
            self.queue.fail(&job.id, &message).await?
        } else {
            self.queue.abandon(&job.id, &message).await?
        };
        self.consumer.announce_failure(&job, &disposition, &message);

        match disposition {
            FailureDisposition::Retrying { attempts } => {
                tracing::warn!(job_id = %job.id, attempts, error = %message, "job failed, will retry");
                Ok(JobReport::Retrying {
                    job_id: job.id,
                    attempts,
                })
            }
            FailureDisposition::Exhausted { attempts } => {
                tracing::error!(job_id = %job.id, attempts, error = %message, "job failed permanently");
                if let Err(e) = self.consumer.record_failure(&job).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to record failure message");
                }
                Ok(JobReport::Failed {
                    job_id: job.id,
                    attempts,
                })
            }
        }
    }

    /// Drive one event to a terminal state and report how it ended.
    ///
    /// Only this event is claimed; other queued events are left for the
    /// regular worker. Waits out retry delays, and a lease held by another
    /// worker, until the event completes or fails.
    pub async fn run_job(&self, job_id: &str) -> anyhow::Result<JobReport> {
        loop {
            if let Some(job) = self.queue.claim_job(job_id).await? {
                let report = if job.status.is_terminal() {
                    self.expire(job).await
                } else {
                    self.process(job).await?
                };
                if !matches!(report, JobReport::Retrying { .. }) {
                    return Ok(report);
                }
                continue;
            }

            let Some(job) = self.queue.get(job_id).await? else {
                anyhow::bail!("Job event {} not found", job_id);
            };
            match job.status {
                JobStatus::Completed => return Ok(JobReport::Completed { job_id: job.id }),
                JobStatus::Failed => {
                    return Ok(JobReport::Failed {
                        job_id: job.id,
                        attempts: job.attempts,
                    });
                }
                JobStatus::Queued | JobStatus::Running => {
                    tokio::time::sleep(self.poll_interval).await
                }
            }
        }
    }

    /// Poll the queue until `shutdown` flips to `true`.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(poll_ms = self.poll_interval.as_millis() as u64, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "worker pass failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::presenter::{PresenterState, ResultPresenter};
    use crate::studio::agent::{AgentRun, CodeAgent, StubProvider};
    use crate::studio::db::StudioDb;
    use crate::studio::models::MessageRole;
    use crate::studio::producer::Producer;
    use crate::studio::queue::QueuePolicy;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records prompts; fails the first `failures` runs.
    struct ScriptedProvider {
        output: serde_json::Value,
        failures: usize,
        calls: Arc<AtomicUsize>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    struct ScriptedAgent {
        spec: AgentSpec,
        output: serde_json::Value,
        failures: usize,
        calls: Arc<AtomicUsize>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CodeAgent for ScriptedAgent {
        fn spec(&self) -> &AgentSpec {
            &self.spec
        }

        async fn run(&self, prompt: &str) -> Result<AgentRun> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("model unavailable (503)");
            }
            Ok(AgentRun {
                output: self.output.clone(),
            })
        }
    }

    impl AgentProvider for ScriptedProvider {
        fn create(&self, spec: &AgentSpec) -> Result<Box<dyn CodeAgent>> {
            Ok(Box::new(ScriptedAgent {
                spec: spec.clone(),
                output: self.output.clone(),
                failures: self.failures,
                calls: self.calls.clone(),
                prompts: self.prompts.clone(),
            }))
        }
    }

    struct BrokenProvider;

    impl AgentProvider for BrokenProvider {
        fn create(&self, _spec: &AgentSpec) -> Result<Box<dyn CodeAgent>> {
            anyhow::bail!("No API key configured for the model backend")
        }
    }

    /// Agent that never answers within a short lease.
    struct SlowProvider;

    struct SlowAgent {
        spec: AgentSpec,
    }

    #[async_trait]
    impl CodeAgent for SlowAgent {
        fn spec(&self) -> &AgentSpec {
            &self.spec
        }

        async fn run(&self, _prompt: &str) -> Result<AgentRun> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(AgentRun {
                output: sandbox_output(),
            })
        }
    }

    impl AgentProvider for SlowProvider {
        fn create(&self, spec: &AgentSpec) -> Result<Box<dyn CodeAgent>> {
            Ok(Box::new(SlowAgent { spec: spec.clone() }))
        }
    }

    fn scripted(output: serde_json::Value, failures: usize) -> ScriptedProvider {
        ScriptedProvider {
            output,
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sandbox_output() -> serde_json::Value {
        json!({
            "files": {"index.ts": "export {}", "lib/util.ts": "export const x = 1;"},
            "url": "https://sandbox.example/abc"
        })
    }

    fn policy(max_attempts: u32, visibility_timeout: Duration) -> QueuePolicy {
        QueuePolicy {
            max_attempts,
            visibility_timeout,
            retry_delay: Duration::ZERO,
        }
    }

    fn setup(agents: Arc<dyn AgentProvider>, max_attempts: u32) -> (Producer, Worker, DbHandle) {
        setup_with_lease(agents, max_attempts, Duration::from_secs(30))
    }

    fn setup_with_lease(
        agents: Arc<dyn AgentProvider>,
        max_attempts: u32,
        visibility_timeout: Duration,
    ) -> (Producer, Worker, DbHandle) {
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let queue = JobQueue::new(db.clone(), policy(max_attempts, visibility_timeout));
        let consumer = JobConsumer::new(db.clone(), agents, AgentSpec::default());
        let worker = Worker::new(queue, consumer, Duration::from_millis(5));
        (Producer::new(db.clone()), worker, db)
    }

    #[tokio::test]
    async fn test_todo_app_end_to_end() {
        let provider = scripted(sandbox_output(), 0);
        let prompts = provider.prompts.clone();
        let (producer, worker, db) = setup(Arc::new(provider), 3);

        let submission = producer.submit("todo app").await.unwrap();
        let project_id = submission.project.id.clone();
        assert_eq!(
            submission.job.payload,
            json!({"value": "todo app", "projectId": project_id})
        );

        // Nothing processed yet: presenter is loading.
        let mut presenter = ResultPresenter::new();
        let before = db.lock_sync().unwrap().list_messages(&project_id).unwrap();
        presenter.update(&before);
        assert!(matches!(presenter.state(), PresenterState::Loading(_)));

        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            report,
            JobReport::Completed {
                job_id: submission.job.id.clone()
            }
        );
        assert_eq!(
            prompts.lock().unwrap().as_slice(),
            ["Write the following snippets for : todo app"]
        );

        let messages = db.lock_sync().unwrap().list_messages(&project_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, MessageRole::Agent);
        let fragment = messages[1].fragment.as_ref().unwrap();
        assert_eq!(fragment.sandbox_url.as_deref(), Some("https://sandbox.example/abc"));

        presenter.update(&messages);
        match presenter.state() {
            PresenterState::Ready(view) => {
                assert_eq!(view.web.src(), Some("https://sandbox.example/abc"));
                let top: Vec<&str> = view.explorer.tree().iter().map(|item| item.name()).collect();
                assert_eq!(top, vec!["index.ts", "lib"]);
            }
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_failure_is_propagated_and_retried() {
        let provider = scripted(sandbox_output(), 1);
        let calls = provider.calls.clone();
        let (producer, worker, db) = setup(Arc::new(provider), 3);
        let submission = producer.submit("landing page").await.unwrap();

        let first = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(first, JobReport::Retrying { attempts: 1, .. }));
        let job = db.lock_sync().unwrap().get_job(&submission.job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.unwrap().contains("503"));

        let second = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(second, JobReport::Completed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_agent_run_past_lease_is_abandoned_and_retried() {
        let (producer, worker, db) =
            setup_with_lease(Arc::new(SlowProvider), 3, Duration::from_millis(50));
        let submission = producer.submit("slow site").await.unwrap();

        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            report,
            JobReport::Retrying {
                job_id: submission.job.id.clone(),
                attempts: 1
            }
        );

        let conn = db.lock_sync().unwrap();
        let job = conn.get_job(&submission.job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.unwrap().contains("timed out"));
        let messages = conn.list_messages(&submission.project.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages.iter().all(|m| m.role == MessageRole::User));
    }

    #[tokio::test]
    async fn test_lapsed_final_lease_records_error_message() {
        let provider = scripted(sandbox_output(), 0);
        let calls = provider.calls.clone();
        let (producer, worker, db) = setup(Arc::new(provider), 1);
        let submission = producer.submit("crashy app").await.unwrap();

        // A worker that died mid-run: it leased the only attempt and vanished.
        let dead = JobQueue::new(db.clone(), policy(1, Duration::ZERO));
        dead.claim().await.unwrap().unwrap();

        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            report,
            JobReport::Failed {
                job_id: submission.job.id.clone(),
                attempts: 1
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(worker.run_once().await.unwrap().is_none());

        let messages = db
            .lock_sync()
            .unwrap()
            .list_messages(&submission.project.id)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].message_type, MessageType::Error);
        assert_eq!(messages[1].content, TERMINAL_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_run_job_leaves_other_events_queued() {
        let (producer, worker, db) = setup(Arc::new(scripted(sandbox_output(), 0)), 3);
        let earlier = producer.submit("someone else's app").await.unwrap();
        let mine = producer.submit("my app").await.unwrap();

        let report = worker.run_job(&mine.job.id).await.unwrap();
        assert_eq!(
            report,
            JobReport::Completed {
                job_id: mine.job.id.clone()
            }
        );

        let conn = db.lock_sync().unwrap();
        let other = conn.get_job(&earlier.job.id).unwrap().unwrap();
        assert_eq!(other.status, JobStatus::Queued);
        assert_eq!(other.attempts, 0);
        assert_eq!(conn.list_messages(&earlier.project.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_job_reports_event_finished_elsewhere() {
        let (producer, worker, _db) = setup(Arc::new(scripted(sandbox_output(), 0)), 3);
        let submission = producer.submit("todo app").await.unwrap();
        worker.run_once().await.unwrap().unwrap();

        let report = worker.run_job(&submission.job.id).await.unwrap();
        assert!(matches!(report, JobReport::Completed { .. }));
        assert!(worker.run_job("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_exhausted_job_records_error_message() {
        let provider = scripted(json!(null), usize::MAX);
        let (producer, worker, db) = setup(Arc::new(provider), 2);
        let submission = producer.submit("blog").await.unwrap();

        let report = worker.run_job(&submission.job.id).await.unwrap();
        assert!(matches!(report, JobReport::Failed { attempts: 2, .. }));

        let messages = db
            .lock_sync()
            .unwrap()
            .list_messages(&submission.project.id)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].message_type, MessageType::Error);
        assert_eq!(messages[1].content, TERMINAL_FAILURE_MESSAGE);

        let mut presenter = ResultPresenter::new();
        presenter.update(&messages);
        assert!(matches!(presenter.state(), PresenterState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_agent_construction_failure_is_a_job_failure() {
        let (producer, worker, db) = setup(Arc::new(BrokenProvider), 1);
        let submission = producer.submit("todo app").await.unwrap();
        let report = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(report, JobReport::Failed { .. }));
        let job = db.lock_sync().unwrap().get_job(&submission.job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("agent construction failed"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_appends_once() {
        let provider = scripted(sandbox_output(), 0);
        let calls = provider.calls.clone();
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let consumer = JobConsumer::new(db.clone(), Arc::new(provider), AgentSpec::default());
        let submission = Producer::new(db.clone()).submit("todo app").await.unwrap();

        let first = consumer.handle(&submission.job).await.unwrap();
        let second = consumer.handle(&submission.job).await.unwrap();
        assert!(matches!(first, AppendOutcome::Created(_)));
        assert!(matches!(second, AppendOutcome::AlreadyRecorded(_)));
        assert_eq!(first.message().id, second.message().id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let messages = db
            .lock_sync()
            .unwrap()
            .list_messages(&submission.project.id)
            .unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_non_string_value_is_coerced_in_prompt() {
        let provider = scripted(json!("ok"), 0);
        let prompts = provider.prompts.clone();
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let consumer = JobConsumer::new(db.clone(), Arc::new(provider), AgentSpec::default());
        let submission = Producer::new(db.clone()).submit("x").await.unwrap();

        let mut job = submission.job.clone();
        job.payload = json!({"value": {"kind": "form"}, "projectId": submission.project.id});
        consumer.handle(&job).await.unwrap();
        assert_eq!(
            prompts.lock().unwrap().as_slice(),
            [r#"Write the following snippets for : {"kind":"form"}"#]
        );
    }

    #[tokio::test]
    async fn test_unknown_event_fails_without_retry() {
        let (_producer, worker, db) = setup(Arc::new(StubProvider::new()), 5);
        let job = db
            .lock_sync()
            .unwrap()
            .enqueue_job("code-agent/other", &json!({"value": "x", "projectId": "p"}))
            .unwrap();
        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            report,
            JobReport::Failed {
                job_id: job.id,
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_plain_text_output_has_no_fragment() {
        let (producer, worker, db) = setup(Arc::new(scripted(json!("I cannot do that"), 0)), 3);
        let submission = producer.submit("x").await.unwrap();
        worker.run_once().await.unwrap();
        let messages = db
            .lock_sync()
            .unwrap()
            .list_messages(&submission.project.id)
            .unwrap();
        assert_eq!(messages[1].content, "I cannot do that");
        assert!(messages[1].fragment.is_none());
    }

    #[tokio::test]
    async fn test_consumer_broadcasts_message_created() {
        let (tx, mut rx) = broadcast::channel(8);
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let consumer = JobConsumer::new(db.clone(), Arc::new(StubProvider::new()), AgentSpec::default())
            .with_events(tx);
        let submission = Producer::new(db).submit("todo app").await.unwrap();
        consumer.handle(&submission.job).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.project_id(), Some(submission.project.id.as_str()));
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let (_producer, worker, _db) = setup(Arc::new(StubProvider::new()), 3);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run_until(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
