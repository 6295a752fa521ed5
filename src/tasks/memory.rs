use super::{TaskError, TaskRecord, TaskStore, cancel_record, start_record};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local task records. Finished records older than `ttl` are
/// dropped whenever a new task is created.
pub struct MemoryTaskStore {
    records: Mutex<HashMap<Uuid, TaskRecord>>,
    ttl: Duration,
}

impl MemoryTaskStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let mut guard = self.records.lock().await;
        let horizon = record.created_at - self.ttl;
        guard.retain(|_, r| r.ended_at.is_none_or(|ended| ended > horizon));
        guard.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, TaskError> {
        let guard = self.records.lock().await;
        Ok(guard.get(&id).cloned())
    }

    async fn update(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let mut guard = self.records.lock().await;
        let stored = guard.get_mut(&record.id).ok_or(TaskError::NotFound)?;
        *stored = record.clone();
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>, TaskError> {
        let guard = self.records.lock().await;
        let mut rows: Vec<TaskRecord> = guard
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<TaskRecord, TaskError> {
        let mut guard = self.records.lock().await;
        let stored = guard.get_mut(&id).ok_or(TaskError::NotFound)?;
        cancel_record(stored, now)?;
        Ok(stored.clone())
    }

    async fn start(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TaskRecord>, TaskError> {
        let mut guard = self.records.lock().await;
        let Some(stored) = guard.get_mut(&id) else {
            return Ok(None);
        };
        if !start_record(stored, now) {
            return Ok(None);
        }
        Ok(Some(stored.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskRequest, TaskState};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, hour, 0, 0).unwrap()
    }

    fn search() -> TaskRequest {
        TaskRequest::Search {
            requirement_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn only_queued_tasks_cancel() {
        let store = MemoryTaskStore::default();
        let queued = TaskRecord::queued(Uuid::new_v4(), search(), at(1));
        store.create(&queued).await.unwrap();
        let cancelled = store.cancel(queued.id, at(1)).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);

        let mut running = TaskRecord::queued(Uuid::new_v4(), search(), at(1));
        running.state = TaskState::Running;
        store.create(&running).await.unwrap();
        let err = store.cancel(running.id, at(1)).await.unwrap_err();
        assert!(matches!(err, TaskError::NotCancellable("running")));
        assert!(matches!(
            store.cancel(Uuid::new_v4(), at(1)).await,
            Err(TaskError::NotFound)
        ));
    }

    #[tokio::test]
    async fn start_and_cancel_exclude_each_other() {
        let store = MemoryTaskStore::default();
        let user = Uuid::new_v4();

        let cancelled = TaskRecord::queued(user, search(), at(1));
        store.create(&cancelled).await.unwrap();
        store.cancel(cancelled.id, at(1)).await.unwrap();
        assert!(store.start(cancelled.id, at(2)).await.unwrap().is_none());
        let kept = store.get(cancelled.id).await.unwrap().unwrap();
        assert_eq!(kept.state, TaskState::Cancelled);

        let started = TaskRecord::queued(user, search(), at(1));
        store.create(&started).await.unwrap();
        let running = store.start(started.id, at(2)).await.unwrap().unwrap();
        assert_eq!(running.state, TaskState::Running);
        assert_eq!(running.started_at, Some(at(2)));
        assert!(store.start(started.id, at(3)).await.unwrap().is_none());
        assert!(matches!(
            store.cancel(started.id, at(3)).await,
            Err(TaskError::NotCancellable("running"))
        ));
        assert!(store.start(Uuid::new_v4(), at(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_records_expire() {
        let store = MemoryTaskStore::new(Duration::hours(1));
        let user = Uuid::new_v4();
        let mut old = TaskRecord::queued(user, search(), at(1));
        old.state = TaskState::Failed {
            error: "boom".into(),
        };
        old.ended_at = Some(at(1));
        store.create(&old).await.unwrap();

        let fresh = TaskRecord::queued(user, search(), at(5));
        store.create(&fresh).await.unwrap();
        let rows = store.list_for_user(user).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, fresh.id);
    }
}
