//! JobProducer: validate a request, persist it, enqueue its job.

use tokio::sync::broadcast;

use super::db::{DbHandle, Submission};
use super::models::{CODE_AGENT_RUN_EVENT, JobPayload};
use super::slug;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::{StudioError, ValidationError};

/// Longest accepted request value, in characters.
pub const MAX_VALUE_LEN: usize = 10_000;

pub fn validate(value: &str) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len == 0 {
        return Err(ValidationError::Empty);
    }
    if len > MAX_VALUE_LEN {
        return Err(ValidationError::TooLong {
            max: MAX_VALUE_LEN,
            actual: len,
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct Producer {
    db: DbHandle,
    events: Option<broadcast::Sender<WsMessage>>,
}

impl Producer {
    pub fn new(db: DbHandle) -> Self {
        Self { db, events: None }
    }

    /// Announce created projects on this channel.
    pub fn with_events(mut self, tx: broadcast::Sender<WsMessage>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Create a project with its USER message and enqueue `code-agent/run`.
    ///
    /// All rows are written in one transaction: a failure leaves no project
    /// and no queued event behind. Identical values are not deduplicated.
    pub async fn submit(&self, value: &str) -> Result<Submission, StudioError> {
        validate(value)?;

        let name = slug::generate_slug();
        let value = value.to_string();
        let submission = self
            .db
            .call(move |db| {
                db.submit(&name, &value, CODE_AGENT_RUN_EVENT, |project_id| {
                    let payload = JobPayload {
                        value: serde_json::Value::String(value.clone()),
                        project_id: project_id.to_string(),
                    };
                    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
                })
            })
            .await
            .map_err(StudioError::Database)?;

        tracing::info!(
            project_id = %submission.project.id,
            job_id = %submission.job.id,
            name = %submission.project.name,
            "submitted generation request"
        );

        if let Some(tx) = &self.events {
            broadcast_message(
                tx,
                WsMessage::ProjectCreated {
                    project: submission.project.clone(),
                },
            );
        }
        Ok(submission)
    }
}
