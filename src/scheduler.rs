//! Periodic loop that scrapes every due requirement.

use crate::clock::Clock;
use crate::metrics;
use crate::scraping::{ScrapeOutcome, ScrapeRunner};
use crate::store::{Store, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            error_backoff: Duration::from_secs(300),
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub due: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub panicked: usize,
}

/// A pass that should be retried after the short back-off.
#[derive(Debug, Error)]
pub enum LoopFailure {
    #[error("due query failed: {0}")]
    DueQuery(#[from] StoreError),
    #[error("{0} scrape task(s) panicked")]
    Panicked(usize),
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    runner: ScrapeRunner,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        runner: ScrapeRunner,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            runner,
            clock,
            config,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Loops until `cancel` fires. Never exits on pass failures.
    pub async fn run(self, cancel: CancellationToken) {
        self.recover().await;
        info!(
            target = "buysmart.scheduler",
            poll_secs = self.config.poll_interval.as_secs(),
            backoff_secs = self.config.error_backoff.as_secs(),
            max_concurrent = self.config.max_concurrent,
            "scheduler_started"
        );
        loop {
            let delay = match self.run_pass(&cancel).await {
                Ok(_) => self.config.poll_interval,
                Err(err) => {
                    error!(target = "buysmart.scheduler", error = %err, "scheduler_pass_failed");
                    self.config.error_backoff
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(target = "buysmart.scheduler", "scheduler_stopped");
    }

    async fn recover(&self) {
        match self.store.recover_interrupted(self.clock.now()).await {
            Ok(0) => {}
            Ok(moved) => {
                warn!(target = "buysmart.scheduler", moved, "recovered_interrupted_scrapes")
            }
            Err(err) => {
                error!(target = "buysmart.scheduler", error = %err, "recovery_failed")
            }
        }
    }

    /// One pass over the due set. Stops dispatching on cancellation but
    /// always awaits what was already dispatched.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport, LoopFailure> {
        let started = Instant::now();
        let due = self.store.due_requirements(self.clock.now()).await?;
        let mut seen = HashSet::with_capacity(due.len());
        let ids: Vec<Uuid> = due
            .iter()
            .map(|r| r.id)
            .filter(|id| seen.insert(*id))
            .collect();

        let mut report = PassReport {
            due: ids.len(),
            ..PassReport::default()
        };
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        for id in ids {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let runner = self.runner.clone();
            tasks.spawn(async move {
                let _permit = permit;
                runner.trigger_due(id).await
            });
            report.dispatched += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ScrapeOutcome::Completed { .. }) => report.completed += 1,
                Ok(ScrapeOutcome::Failed { .. }) => report.failed += 1,
                Ok(ScrapeOutcome::Skipped { .. }) => report.skipped += 1,
                Err(err) => {
                    error!(target = "buysmart.scheduler", error = %err, "scrape_task_panicked");
                    report.panicked += 1;
                }
            }
        }

        info!(
            target = "buysmart.scheduler",
            due = report.due,
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "scheduler_pass_done"
        );
        metrics::pass_finished(report.dispatched, started.elapsed().as_millis());
        if report.panicked > 0 {
            return Err(LoopFailure::Panicked(report.panicked));
        }
        Ok(report)
    }
}
