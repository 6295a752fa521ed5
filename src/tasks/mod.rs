//! Ad hoc background tasks (search, analyze, valuate) and their records.

pub mod memory;
pub mod queue;
pub mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryTaskStore;
pub use queue::{QueueStatus, TaskCounts, TaskDeps, TaskQueue};
pub use redis_store::RedisTaskStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRequest {
    Search { requirement_id: Uuid },
    Analyze { listing_ids: Vec<Uuid> },
    Valuate { listing_ids: Vec<Uuid> },
}

impl TaskRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskRequest::Search { .. } => "search",
            TaskRequest::Analyze { .. } => "analyze",
            TaskRequest::Valuate { .. } => "valuate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed { result: serde_json::Value },
    Failed { error: String },
    Cancelled,
}

impl TaskState {
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub request: TaskRequest,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn queued(user_id: Uuid, request: TaskRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            request,
            state: TaskState::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found")]
    NotFound,
    #[error("task is {0} and can no longer be cancelled")]
    NotCancellable(&'static str),
    #[error("task queue is full")]
    QueueFull,
    #[error("task worker is not running")]
    WorkerGone,
    #[error("task backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, record: &TaskRecord) -> Result<(), TaskError>;
    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, TaskError>;
    async fn update(&self, record: &TaskRecord) -> Result<(), TaskError>;
    /// Newest first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>, TaskError>;
    /// Moves a queued task to `cancelled`; anything else is refused.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<TaskRecord, TaskError>;
    /// Moves a queued task to `running` in one step, so a concurrent cancel
    /// either wins or is refused. `None` when the task is missing or no
    /// longer queued.
    async fn start(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TaskRecord>, TaskError>;
}

pub(crate) fn start_record(record: &mut TaskRecord, now: DateTime<Utc>) -> bool {
    if record.state != TaskState::Queued {
        return false;
    }
    record.state = TaskState::Running;
    record.started_at = Some(now);
    true
}

pub(crate) fn cancel_record(record: &mut TaskRecord, now: DateTime<Utc>) -> Result<(), TaskError> {
    if record.state != TaskState::Queued {
        return Err(TaskError::NotCancellable(record.state.label()));
    }
    record.state = TaskState::Cancelled;
    record.ended_at = Some(now);
    Ok(())
}
