//! Work item state machine and log plumbing

use crate::error::{DeckhandError, Result};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as _;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Task state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Task is queued
    #[default]
    Waiting,
    /// Task is being reconciled
    Executing,
    /// Task failed
    Failed,
    /// Task completed
    Done,
}

impl TaskStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Done => "DONE",
        }
    }

    /// Check if the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Done)
    }

    /// Check if moving to `next` is allowed
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Waiting, TaskStatus::Executing)
                | (TaskStatus::Executing, TaskStatus::Done)
                | (TaskStatus::Executing, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DeckhandError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING" => Ok(TaskStatus::Waiting),
            "EXECUTING" => Ok(TaskStatus::Executing),
            "FAILED" => Ok(TaskStatus::Failed),
            "DONE" => Ok(TaskStatus::Done),
            other => Err(DeckhandError::Store(format!("Unknown task status: {}", other))),
        }
    }
}

/// Decoded intent carried by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskPayload {
    /// Deploy an image to the task's service
    Deploy {
        image: String,
        /// Deploy record that produced the task, when created programmatically
        #[serde(default, rename = "deployId", skip_serializing_if = "Option::is_none")]
        deploy_id: Option<String>,
    },
}

impl TaskPayload {
    /// Decode the raw payload of a task
    pub fn decode(task: &Task) -> Result<Self> {
        serde_json::from_value(task.payload.clone()).map_err(|e| DeckhandError::UnknownPayload {
            task_id: task.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Human-readable task type
    pub fn label(&self) -> &'static str {
        match self {
            TaskPayload::Deploy { .. } => "Deploy",
        }
    }
}

/// Queued deployment intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task ID
    pub id: String,
    /// Target service ID
    pub service_id: String,
    /// Raw payload as written by the producer
    pub payload: serde_json::Value,
    /// Current status
    pub status: TaskStatus,
    /// Append-only progress log
    pub log: Vec<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Started timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Finished timestamp
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new waiting task
    pub fn new(service_id: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service_id: service_id.to_string(),
            payload,
            status: TaskStatus::Waiting,
            log: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Create a task deploying `image`
    pub fn deploy(service_id: &str, image: &str) -> Self {
        Self::new(
            service_id,
            serde_json::json!({ "kind": "deploy", "image": image }),
        )
    }

    /// Apply a status transition, stamping the matching timestamp
    pub fn transition(&mut self, next: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DeckhandError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        if next == TaskStatus::Executing {
            self.started_at = Some(at);
        } else {
            self.finished_at = Some(at);
        }
        Ok(())
    }

    /// Check if the task is terminal
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Writes progress lines and the final status of one task
#[derive(Clone)]
pub struct TaskJournal {
    store: Arc<dyn TaskStore>,
    task_id: String,
}

impl TaskJournal {
    /// Create a journal for a task
    pub fn new(store: Arc<dyn TaskStore>, task_id: &str) -> Self {
        Self {
            store,
            task_id: task_id.to_string(),
        }
    }

    /// Append a progress line
    pub async fn log(&self, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        debug!(task_id = %self.task_id, "{}", line);
        self.store.append_log(&self.task_id, &line).await
    }

    /// Append a warning line for a non-fatal problem
    pub async fn warn(&self, message: impl fmt::Display) -> Result<()> {
        warn!(task_id = %self.task_id, "{}", message);
        self.store
            .append_log(&self.task_id, &format!("✗ Warning: {}", message))
            .await
    }

    /// Mark the task done
    pub async fn finish_done(&self) -> Result<()> {
        self.store
            .finish(&self.task_id, TaskStatus::Done, Utc::now())
            .await
    }

    /// Record a fatal error and mark the task failed
    pub async fn finish_failed(&self, err: &DeckhandError) -> Result<()> {
        let mut shown = err.to_string();
        self.log(format!("✗ Deployment failed: {}", shown)).await?;

        // Causes already embedded in the message above are not repeated
        // Render the cause chain up front so no `&dyn Error` is held across an await
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        for text in causes {
            if !shown.contains(&text) {
                self.log(format!("  caused by: {}", text)).await?;
            }
            shown = text;
        }

        self.store
            .finish(&self.task_id, TaskStatus::Failed, Utc::now())
            .await
    }
}
