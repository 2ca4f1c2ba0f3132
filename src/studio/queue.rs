//! Durable job queue backed by the `job_events` table.
//!
//! Delivery is at-least-once: a claimed event carries a lease, and an event
//! whose lease expires without `complete`/`fail` is handed out again.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use super::db::{DbHandle, format_ts};
use super::models::{JobEvent, JobStatus};

/// Retry and lease settings for the queue.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// What happened to an event after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Back in the queue; will be redelivered.
    Retrying { attempts: u32 },
    /// Attempts exhausted.
    Exhausted { attempts: u32 },
}

#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    policy: QueuePolicy,
}

fn offset(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl JobQueue {
    pub fn new(db: DbHandle, policy: QueuePolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Events not yet in a terminal state.
    pub async fn pending(&self) -> Result<i64> {
        self.db
            .call(|db| Ok(db.count_jobs(JobStatus::Queued)? + db.count_jobs(JobStatus::Running)?))
            .await
    }

    /// Lease the next deliverable event, if any.
    ///
    /// An event whose lease lapsed on its last allowed attempt comes back
    /// already `failed` (see [`JobStatus::is_terminal`]); it must not be run.
    pub async fn claim(&self) -> Result<Option<JobEvent>> {
        let now = Utc::now();
        let lease_until = now + offset(self.policy.visibility_timeout);
        let (now, lease_until) = (format_ts(now), format_ts(lease_until));
        let max_attempts = self.policy.max_attempts;
        self.db
            .call(move |db| db.claim_next_job(&now, &lease_until, max_attempts))
            .await
    }

    /// Lease one specific event, if it is deliverable now.
    pub async fn claim_job(&self, id: &str) -> Result<Option<JobEvent>> {
        let now = Utc::now();
        let lease_until = now + offset(self.policy.visibility_timeout);
        let (now, lease_until) = (format_ts(now), format_ts(lease_until));
        let (id, max_attempts) = (id.to_string(), self.policy.max_attempts);
        self.db
            .call(move |db| db.claim_job(&id, &now, &lease_until, max_attempts))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobEvent>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_job(&id)).await
    }

    pub async fn complete(&self, id: &str) -> Result<JobEvent> {
        let id = id.to_string();
        self.db.call(move |db| db.complete_job(&id)).await
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<FailureDisposition> {
        let id = id.to_string();
        let error = error.to_string();
        let max_attempts = self.policy.max_attempts;
        let retry_at = format_ts(Utc::now() + offset(self.policy.retry_delay));
        let job = self
            .db
            .call(move |db| db.fail_job(&id, &error, max_attempts, &retry_at))
            .await?;
        Ok(disposition(&job))
    }

    /// Fail an event without further retries (it can never succeed).
    pub async fn abandon(&self, id: &str, error: &str) -> Result<FailureDisposition> {
        let id = id.to_string();
        let error = error.to_string();
        let job = self
            .db
            .call(move |db| db.fail_job(&id, &error, 0, &format_ts(Utc::now())))
            .await?;
        Ok(disposition(&job))
    }
}

fn disposition(job: &JobEvent) -> FailureDisposition {
    match job.status {
        JobStatus::Failed => FailureDisposition::Exhausted {
            attempts: job.attempts,
        },
        _ => FailureDisposition::Retrying {
            attempts: job.attempts,
        },
    }
}
