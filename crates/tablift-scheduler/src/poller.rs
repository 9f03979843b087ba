//! Poller — the fixed-period loop that decides which tasks are due,
//! creates their execution records, and hands the ids to the dispatch
//! queue. Also owns the slower initialization scan and the lost-Waiting
//! reconciliation sweep.
//!
//! Splitting "became due" (here) from "is running" (workers) keeps the
//! trigger decision cheap and frequent while execution stays bounded by
//! worker concurrency. All due-check state lives in the store, so the
//! poller is restart-safe.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tablift_core::config::SchedulerConfig;
use tablift_core::Result;

use crate::cron::Schedule;
use crate::generator::ConfigGenerator;
use crate::model::{ExecStatus, Execution, Task, TaskStatus, TriggerType};
use crate::monitor::QueueMonitor;
use crate::queue::DispatchQueue;
use crate::store::Store;

/// The trigger side of the pipeline.
pub struct Poller {
    store: Store,
    queue: DispatchQueue,
    monitor: Arc<QueueMonitor>,
    generator: Arc<dyn ConfigGenerator>,
    /// A Waiting execution older than this without a queue entry is
    /// considered lost and re-enqueued.
    reconcile_after: Duration,
}

impl Poller {
    pub fn new(
        store: Store,
        queue: DispatchQueue,
        monitor: Arc<QueueMonitor>,
        generator: Arc<dyn ConfigGenerator>,
        reconcile_after_secs: i64,
    ) -> Self {
        Self {
            store,
            queue,
            monitor,
            generator,
            reconcile_after: Duration::seconds(reconcile_after_secs),
        }
    }

    /// One poll cycle. Returns the number of executions dispatched.
    pub async fn run_cycle(&self) -> usize {
        self.run_cycle_at(Utc::now()).await
    }

    /// Poll cycle against an explicit "now" — the boundary semantics are
    /// pinned by tests through this entry point.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> usize {
        let tasks = match self.store.candidate_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Poll cycle: candidate query failed: {e}");
                return 0;
            }
        };

        let mut dispatched = 0;
        for task in tasks {
            match self.due_check(&task, now).await {
                Ok(Some(next_fire)) => {
                    match self
                        .dispatch(&task, TriggerType::Scheduled, Some((now, next_fire)))
                        .await
                    {
                        Ok(execution_id) => {
                            tracing::info!(
                                "Dispatched task {} ('{}') as execution {execution_id}",
                                task.id,
                                task.name
                            );
                            dispatched += 1;
                        }
                        // One task's dispatch failure never aborts the cycle.
                        Err(e) => {
                            tracing::warn!("Dispatch failed for task {}: {e}", task.id);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Due-check failed for task {}: {e}", task.id);
                }
            }
        }

        if let Ok(depth) = self.queue.len().await {
            self.monitor.record_depth(depth);
        }
        dispatched
    }

    /// The `shouldExecute` decision. `Ok(Some(next_fire))` means the task is
    /// due now; `next_fire` is the bookkeeping value for the fire after this
    /// one.
    async fn due_check(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<Option<Option<DateTime<Utc>>>> {
        if task.cron_expression.is_empty() {
            return Ok(None);
        }
        let schedule = match Schedule::parse(&task.cron_expression) {
            Ok(s) => s,
            Err(e) => {
                // ScheduleError: skipped, task left as-is.
                tracing::warn!("Task {}: {e}", task.id);
                return Ok(None);
            }
        };

        // Mutual exclusion: at most one outstanding execution per task.
        if self.store.outstanding_count(task.id).await? > 0 {
            return Ok(None);
        }

        let anchor = task.last_fire.unwrap_or(DateTime::UNIX_EPOCH);
        let next = match schedule.next_after(anchor) {
            Some(next) => next,
            None => {
                tracing::warn!(
                    "Task {}: schedule '{}' has no next fire time",
                    task.id,
                    task.cron_expression
                );
                return Ok(None);
            }
        };

        // Inclusive boundary: due when the fire instant is not after now.
        let due = next <= now || self.retry_due(task, now).await?;
        if !due {
            return Ok(None);
        }
        Ok(Some(schedule.next_after(now)))
    }

    /// Bounded-retry policy: a Failed execution may re-fire before the next
    /// natural cron tick, at most `retry_times` times since the last
    /// success and no sooner than `retry_interval_secs` after the failure.
    async fn retry_due(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        if task.retry_times == 0 {
            return Ok(false);
        }
        let Some(last) = self.store.last_execution(task.id).await? else {
            return Ok(false);
        };
        if last.status != ExecStatus::Failed {
            return Ok(false);
        }
        let failures = self.store.failures_since_success(task.id).await?;
        if failures > task.retry_times as i64 {
            return Ok(false);
        }
        let Some(failed_at) = last.end_time else {
            return Ok(false);
        };
        Ok(now >= failed_at + Duration::seconds(task.retry_interval_secs))
    }

    /// Create the Waiting execution, update the task's fire bookkeeping,
    /// and enqueue — in that order. If the enqueue fails after the create
    /// succeeded, the execution stays Waiting and the reconciliation sweep
    /// picks it up.
    async fn dispatch(
        &self,
        task: &Task,
        trigger_type: TriggerType,
        fire: Option<(DateTime<Utc>, Option<DateTime<Utc>>)>,
    ) -> Result<i64> {
        let now = Utc::now();
        let execution = Execution {
            id: 0,
            task_id: task.id,
            start_time: now,
            end_time: None,
            duration_secs: None,
            status: ExecStatus::Waiting,
            trigger_type,
            payload: self.generator.generate(task),
            stats: None,
            log_path: None,
            error_message: None,
        };
        let execution_id = self.store.create_execution(&execution).await?;

        match fire {
            Some((fired_at, next_fire)) => {
                self.store
                    .update_task_fire(task.id, TaskStatus::Pending, Some(fired_at), next_fire)
                    .await?;
            }
            // Manual triggers don't shift the cron bookkeeping.
            None => {
                self.store
                    .set_task_status(task.id, TaskStatus::Pending)
                    .await?;
            }
        }

        self.queue.enqueue(execution_id).await?;
        self.monitor.record_enqueue();
        Ok(execution_id)
    }

    /// Initialization scan: compute `next_fire` for tasks that have a
    /// schedule but no bookkeeping yet. Runs on a slower period than the
    /// poll cycle.
    pub async fn run_init_scan(&self) -> usize {
        let tasks = match self.store.tasks_needing_init().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Init scan: query failed: {e}");
                return 0;
            }
        };
        let now = Utc::now();
        let mut initialized = 0;
        for task in tasks {
            let next = match Schedule::parse(&task.cron_expression) {
                Ok(s) => s.next_after(now),
                Err(e) => {
                    tracing::warn!("Init scan: task {}: {e}", task.id);
                    continue;
                }
            };
            if let Err(e) = self.store.set_next_fire(task.id, next).await {
                tracing::warn!("Init scan: task {}: {e}", task.id);
                continue;
            }
            initialized += 1;
        }
        initialized
    }

    /// Re-enqueue Waiting executions that lost their queue entry (an
    /// enqueue failure after create, or a crash in between).
    pub async fn run_reconcile(&self) -> usize {
        let cutoff = Utc::now() - self.reconcile_after;
        let lost = match self.store.lost_waiting_executions(cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("Reconcile sweep: query failed: {e}");
                return 0;
            }
        };
        let mut recovered = 0;
        for execution_id in lost {
            match self.queue.enqueue(execution_id).await {
                Ok(()) => {
                    tracing::info!("Re-enqueued lost waiting execution {execution_id}");
                    self.monitor.record_enqueue();
                    recovered += 1;
                }
                Err(e) => {
                    tracing::warn!("Re-enqueue of execution {execution_id} failed: {e}");
                }
            }
        }
        recovered
    }

    /// Manual trigger: same create + enqueue path as a scheduled fire,
    /// bypassing the due-check but not the outstanding-execution guard.
    pub async fn trigger(&self, task_id: i64, trigger_type: TriggerType) -> Result<i64> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| tablift_core::TabliftError::Store(format!("task {task_id} not found")))?;
        if task.status == TaskStatus::Disabled {
            return Err(tablift_core::TabliftError::Store(format!(
                "task {task_id} is disabled"
            )));
        }
        if self.store.outstanding_count(task_id).await? > 0 {
            return Err(tablift_core::TabliftError::Store(format!(
                "task {task_id} already has an outstanding execution"
            )));
        }
        self.dispatch(&task, trigger_type, None).await
    }

    /// Batch variant of [`Poller::trigger`]; failures are logged and
    /// skipped, successes are returned.
    pub async fn trigger_group(&self, task_ids: &[i64]) -> Vec<i64> {
        let mut created = Vec::new();
        for &task_id in task_ids {
            match self.trigger(task_id, TriggerType::ManualBatch).await {
                Ok(execution_id) => created.push(execution_id),
                Err(e) => tracing::warn!("Batch trigger: task {task_id}: {e}"),
            }
        }
        created
    }
}

/// Run the poller loop until the shutdown signal flips.
pub fn spawn_poller(
    poller: Arc<Poller>,
    config: &SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let poll_period = std::time::Duration::from_secs(config.poll_secs.max(1));
    // Init scan and reconcile ride the poll tick at a lower frequency.
    let slow_every = (config.init_scan_secs / config.poll_secs.max(1)).max(1);

    tokio::spawn(async move {
        tracing::info!(
            "Poller started (poll every {}s)",
            poll_period.as_secs()
        );
        let mut interval = tokio::time::interval(poll_period);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                tracing::info!("Poller stopping");
                break;
            }
            poller.run_cycle().await;
            ticks += 1;
            if ticks % slow_every == 0 {
                poller.run_init_scan().await;
                poller.run_reconcile().await;
            }
        }
    })
}
