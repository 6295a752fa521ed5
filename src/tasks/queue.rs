use super::{TaskError, TaskRecord, TaskRequest, TaskState, TaskStore};
use crate::advisor::AdvisorService;
use crate::clock::Clock;
use crate::scraping::{ScrapeOutcome, ScrapeRunner};
use crate::store::StoreError;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// What the worker needs to execute tasks.
#[derive(Clone)]
pub struct TaskDeps {
    pub runner: ScrapeRunner,
    pub advisor: AdvisorService,
    pub tasks: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Channel occupancy plus the caller's own tasks by state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub capacity: usize,
    pub waiting: usize,
    pub worker_running: bool,
    pub tasks: TaskCounts,
}

/// Bounded queue of task ids drained by a single worker.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Uuid>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn spawn(deps: TaskDeps, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Uuid>(capacity.max(1));
        let queue = Self {
            tx,
            tasks: deps.tasks.clone(),
            clock: deps.clock.clone(),
        };

        let handle = tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                if let Err(err) = process(&deps, id).await {
                    warn!(target = "buysmart.tasks", task_id = %id, error = %err, "task_bookkeeping_failed");
                }
            }
        });

        (queue, handle)
    }

    pub async fn submit(
        &self,
        user_id: Uuid,
        request: TaskRequest,
    ) -> Result<TaskRecord, TaskError> {
        let record = TaskRecord::queued(user_id, request, self.clock.now());
        self.tasks.create(&record).await?;
        match self.tx.try_send(record.id) {
            Ok(()) => {
                info!(target = "buysmart.tasks", task_id = %record.id, kind = record.request.kind(), "task_queued");
                Ok(record)
            }
            Err(err) => {
                let mut dropped = record;
                dropped.state = TaskState::Failed {
                    error: "not queued".into(),
                };
                dropped.ended_at = Some(self.clock.now());
                self.tasks.update(&dropped).await?;
                Err(match err {
                    TrySendError::Full(_) => TaskError::QueueFull,
                    TrySendError::Closed(_) => TaskError::WorkerGone,
                })
            }
        }
    }

    /// Records of other users are reported as missing.
    pub async fn get(&self, id: Uuid, user_id: Uuid) -> Result<TaskRecord, TaskError> {
        self.tasks
            .get(id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or(TaskError::NotFound)
    }

    pub async fn cancel(&self, id: Uuid, user_id: Uuid) -> Result<TaskRecord, TaskError> {
        self.get(id, user_id).await?;
        let record = self.tasks.cancel(id, self.clock.now()).await?;
        info!(target = "buysmart.tasks", task_id = %id, "task_cancelled");
        Ok(record)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>, TaskError> {
        self.tasks.list_for_user(user_id).await
    }

    pub async fn status(&self, user_id: Uuid) -> Result<QueueStatus, TaskError> {
        let mut tasks = TaskCounts::default();
        for record in self.tasks.list_for_user(user_id).await? {
            let slot = match record.state {
                TaskState::Queued => &mut tasks.queued,
                TaskState::Running => &mut tasks.running,
                TaskState::Completed { .. } => &mut tasks.completed,
                TaskState::Failed { .. } => &mut tasks.failed,
                TaskState::Cancelled => &mut tasks.cancelled,
            };
            *slot += 1;
        }
        let capacity = self.tx.max_capacity();
        Ok(QueueStatus {
            capacity,
            waiting: capacity - self.tx.capacity(),
            worker_running: !self.tx.is_closed(),
            tasks,
        })
    }
}

async fn process(deps: &TaskDeps, id: Uuid) -> Result<(), TaskError> {
    let Some(mut record) = deps.tasks.start(id, deps.clock.now()).await? else {
        info!(target = "buysmart.tasks", task_id = %id, "task_skipped");
        return Ok(());
    };

    record.state = execute(deps, &record).await;
    record.ended_at = Some(deps.clock.now());
    info!(
        target = "buysmart.tasks",
        task_id = %id,
        kind = record.request.kind(),
        state = record.state.label(),
        "task_finished"
    );
    deps.tasks.update(&record).await
}

async fn execute(deps: &TaskDeps, record: &TaskRecord) -> TaskState {
    match &record.request {
        TaskRequest::Search { requirement_id } => {
            match deps.runner.trigger(*requirement_id).await {
                ScrapeOutcome::Failed { reason } => TaskState::Failed { error: reason },
                outcome => TaskState::Completed {
                    result: json!(outcome),
                },
            }
        }
        TaskRequest::Analyze { listing_ids } => {
            per_listing(listing_ids, |listing_id| async move {
                deps.advisor
                    .analyze(listing_id, record.user_id)
                    .await
                    .map(|analysis| json!(analysis))
            })
            .await
        }
        TaskRequest::Valuate { listing_ids } => {
            per_listing(listing_ids, |listing_id| async move {
                deps.advisor
                    .valuate(listing_id, record.user_id)
                    .await
                    .map(|valuation| json!(valuation))
            })
            .await
        }
    }
}

/// Missing listings are reported inline; a backend error fails the task.
async fn per_listing<F, Fut>(listing_ids: &[Uuid], mut run: F) -> TaskState
where
    F: FnMut(Uuid) -> Fut,
    Fut: Future<Output = Result<Value, StoreError>>,
{
    let mut results = Vec::with_capacity(listing_ids.len());
    for &listing_id in listing_ids {
        match run(listing_id).await {
            Ok(value) => results.push(json!({ "listing_id": listing_id, "result": value })),
            Err(StoreError::NotFound(what)) => results.push(json!({
                "listing_id": listing_id,
                "error": format!("{what} not found"),
            })),
            Err(err) => {
                return TaskState::Failed {
                    error: err.to_string(),
                };
            }
        }
    }
    TaskState::Completed {
        result: Value::Array(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::HeuristicAdvisor;
    use crate::clock::ManualClock;
    use crate::models::Requirement;
    use crate::scraping::ScrapeConfig;
    use crate::scraping::tests::{FixedScraper, iphone_candidates, iphone_requirement};
    use crate::store::{MemoryStore, Store};
    use crate::tasks::MemoryTaskStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        tasks: Arc<MemoryTaskStore>,
        deps: TaskDeps,
        requirement: Requirement,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let tasks = Arc::new(MemoryTaskStore::default());
        let requirement = store
            .insert_requirement(iphone_requirement(Uuid::new_v4(), clock.as_ref()))
            .await
            .unwrap();
        let runner = ScrapeRunner::new(
            store.clone(),
            Arc::new(FixedScraper(iphone_candidates())),
            clock.clone(),
            ScrapeConfig::default(),
        );
        let advisor = AdvisorService::new(
            store.clone(),
            Arc::new(HeuristicAdvisor),
            Arc::new(HeuristicAdvisor),
            clock.clone(),
        );
        Fixture {
            store,
            tasks: tasks.clone(),
            deps: TaskDeps {
                runner,
                advisor,
                tasks,
                clock,
            },
            requirement,
        }
    }

    async fn wait_finished(queue: &TaskQueue, id: Uuid, user_id: Uuid) -> TaskRecord {
        for _ in 0..100 {
            let record = queue.get(id, user_id).await.unwrap();
            if record.state.is_finished() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn search_then_analyze_tasks_complete() {
        let fx = fixture().await;
        let user = fx.requirement.user_id;
        let (queue, _worker) = TaskQueue::spawn(fx.deps.clone(), 8);

        let search = queue
            .submit(
                user,
                TaskRequest::Search {
                    requirement_id: fx.requirement.id,
                },
            )
            .await
            .unwrap();
        let done = wait_finished(&queue, search.id, user).await;
        match done.state {
            TaskState::Completed { result } => {
                assert_eq!(result["outcome"], "completed");
                assert_eq!(result["matching"], 1);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(done.started_at.is_some() && done.ended_at.is_some());

        let listings = fx.store.listings_for_requirement(fx.requirement.id).await.unwrap();
        let missing = Uuid::new_v4();
        let analyze = queue
            .submit(
                user,
                TaskRequest::Analyze {
                    listing_ids: vec![listings[0].id, missing],
                },
            )
            .await
            .unwrap();
        let done = wait_finished(&queue, analyze.id, user).await;
        let TaskState::Completed { result } = done.state else {
            panic!("analyze task failed");
        };
        assert!(result[0]["result"]["overall_score"].is_number());
        assert_eq!(result[1]["error"], "listing not found");
        let scored = fx.store.get_listing(listings[0].id).await.unwrap().unwrap();
        assert!(scored.overall_score.is_some());
    }

    #[tokio::test]
    async fn cancelled_task_is_skipped_by_worker() {
        let fx = fixture().await;
        let user = fx.requirement.user_id;
        // no worker: the receiver is dropped only after the test
        let (tx, _rx) = mpsc::channel(4);
        let queue = TaskQueue {
            tx,
            tasks: fx.tasks.clone(),
            clock: fx.deps.clock.clone(),
        };
        let record = queue
            .submit(
                user,
                TaskRequest::Search {
                    requirement_id: fx.requirement.id,
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            queue.cancel(record.id, Uuid::new_v4()).await,
            Err(TaskError::NotFound)
        ));
        let cancelled = queue.cancel(record.id, user).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);

        process(&fx.deps, record.id).await.unwrap();
        let after = queue.get(record.id, user).await.unwrap();
        assert_eq!(after.state, TaskState::Cancelled);
        assert!(after.started_at.is_none());
        let untouched = fx.store.get_requirement(fx.requirement.id).await.unwrap().unwrap();
        assert_eq!(untouched.scraping_status, fx.requirement.scraping_status);
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let fx = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let queue = TaskQueue {
            tx,
            tasks: fx.tasks.clone(),
            clock: fx.deps.clock.clone(),
        };
        let request = TaskRequest::Valuate {
            listing_ids: vec![],
        };
        queue.submit(Uuid::new_v4(), request.clone()).await.unwrap();
        let err = queue.submit(Uuid::new_v4(), request).await.unwrap_err();
        assert!(matches!(err, TaskError::QueueFull));
    }

    #[tokio::test]
    async fn status_counts_waiting_ids_and_own_tasks() {
        let fx = fixture().await;
        let user = fx.requirement.user_id;
        let (tx, rx) = mpsc::channel(4);
        let queue = TaskQueue {
            tx,
            tasks: fx.tasks.clone(),
            clock: fx.deps.clock.clone(),
        };
        let request = TaskRequest::Valuate {
            listing_ids: vec![],
        };
        let first = queue.submit(user, request.clone()).await.unwrap();
        queue.submit(user, request.clone()).await.unwrap();
        queue.submit(Uuid::new_v4(), request).await.unwrap();
        queue.cancel(first.id, user).await.unwrap();

        let status = queue.status(user).await.unwrap();
        assert_eq!(status.capacity, 4);
        assert_eq!(status.waiting, 3);
        assert!(status.worker_running);
        assert_eq!(
            status.tasks,
            TaskCounts {
                queued: 1,
                cancelled: 1,
                ..TaskCounts::default()
            }
        );

        drop(rx);
        assert!(!queue.status(user).await.unwrap().worker_running);
    }
}
