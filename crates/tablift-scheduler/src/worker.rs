//! Worker pool — a bounded set of workers draining the dispatch queue.
//! Each iteration claims an execution (Waiting→Running compare-and-set),
//! pre-flights, runs the engine, and finalizes. Every failure is converted
//! into a state transition; nothing escapes a worker iteration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use tablift_core::config::SchedulerConfig;

use crate::model::{ExecStats, ExecStatus, Execution, Task, TaskStatus};
use crate::monitor::QueueMonitor;
use crate::queue::DispatchQueue;
use crate::runner::{EngineRunner, RunnerError};
use crate::store::Store;

/// One worker's processing context.
#[derive(Clone)]
pub struct Worker {
    store: Store,
    monitor: Arc<QueueMonitor>,
    runner: EngineRunner,
    log_dir: PathBuf,
}

impl Worker {
    pub fn new(
        store: Store,
        monitor: Arc<QueueMonitor>,
        runner: EngineRunner,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            monitor,
            runner,
            log_dir,
        }
    }

    /// Process one dequeued execution id. Infallible by design: every error
    /// becomes a Failed record (or a log line when there is nothing to
    /// record against).
    pub async fn process(&self, execution_id: i64) {
        // Claim. A redelivered or already-terminal id fails the
        // compare-and-set and is dropped here — terminal records are never
        // moved back to Running.
        match self.store.claim_execution(execution_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Execution {execution_id}: stale or redelivered, skipping");
                return;
            }
            Err(e) => {
                tracing::error!("Execution {execution_id}: claim failed: {e}");
                return;
            }
        }

        let execution = match self.store.get_execution(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                tracing::error!("Execution {execution_id} vanished after claim");
                return;
            }
            Err(e) => {
                tracing::error!("Execution {execution_id}: fetch failed: {e}");
                return;
            }
        };

        let task = match self.store.get_task(execution.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.fail(&execution, None, "owning task no longer exists").await;
                return;
            }
            Err(e) => {
                self.fail(&execution, None, &format!("task fetch failed: {e}")).await;
                return;
            }
        };

        if let Err(e) = self
            .store
            .set_task_status(task.id, TaskStatus::Running)
            .await
        {
            tracing::warn!("Task {}: status update failed: {e}", task.id);
        }

        // Pre-flight: the execution still traverses Running→Failed so the
        // record gets a start and end time, but no process is spawned.
        if !self.runner.home_exists() {
            let msg = format!(
                "engine home not found: {}",
                self.runner.home().display()
            );
            self.fail(&execution, Some(&task), &msg).await;
            return;
        }
        let Some(payload) = execution.payload.clone() else {
            self.fail(&execution, Some(&task), "config generator returned no payload")
                .await;
            return;
        };

        tracing::info!(
            "Execution {execution_id}: running task {} ('{}')",
            task.id,
            task.name
        );

        match self.runner.run(execution_id, &payload, task.timeout_secs).await {
            Ok(out) if out.success() => {
                let stats = self.runner.parse_stats(&out.output);
                if stats.is_none() {
                    // StatsParseError degrades, never fails the execution.
                    tracing::warn!(
                        "Execution {execution_id}: statistics trailer unparseable"
                    );
                }
                let log_path = self.write_log(execution_id, &out.output);
                self.succeed(&execution, &task, stats, log_path.as_deref()).await;
            }
            Ok(out) => {
                let log_path = self.write_log(execution_id, &out.output);
                let msg = format!("engine exited with code {}", out.exit_code);
                self.fail_with_log(&execution, Some(&task), &msg, log_path.as_deref())
                    .await;
            }
            Err(RunnerError::Timeout { secs }) => {
                let msg = format!("engine run timed out after {secs}s and was killed");
                self.fail(&execution, Some(&task), &msg).await;
            }
            Err(e) => {
                self.fail(&execution, Some(&task), &e.to_string()).await;
            }
        }
    }

    async fn succeed(
        &self,
        execution: &Execution,
        task: &Task,
        stats: Option<ExecStats>,
        log_path: Option<&str>,
    ) {
        match self
            .store
            .finalize_execution(execution.id, ExecStatus::Success, stats, log_path, None)
            .await
        {
            Ok(true) => {
                self.monitor.record_success();
                tracing::info!("Execution {} succeeded", execution.id);
            }
            Ok(false) => {
                tracing::warn!("Execution {} was already finalized", execution.id);
            }
            Err(e) => {
                tracing::error!("Execution {}: finalize failed: {e}", execution.id);
            }
        }
        if let Err(e) = self.store.set_task_status(task.id, TaskStatus::New).await {
            tracing::warn!("Task {}: status update failed: {e}", task.id);
        }
    }

    async fn fail(&self, execution: &Execution, task: Option<&Task>, message: &str) {
        self.fail_with_log(execution, task, message, None).await;
    }

    async fn fail_with_log(
        &self,
        execution: &Execution,
        task: Option<&Task>,
        message: &str,
        log_path: Option<&str>,
    ) {
        tracing::error!("Execution {} failed: {message}", execution.id);
        match self
            .store
            .finalize_execution(
                execution.id,
                ExecStatus::Failed,
                None,
                log_path,
                Some(message),
            )
            .await
        {
            Ok(true) => self.monitor.record_failure(),
            Ok(false) => {
                tracing::warn!("Execution {} was already finalized", execution.id);
            }
            Err(e) => {
                tracing::error!("Execution {}: finalize failed: {e}", execution.id);
            }
        }
        if let Some(task) = task {
            if let Err(e) = self.store.set_task_status(task.id, TaskStatus::Error).await {
                tracing::warn!("Task {}: status update failed: {e}", task.id);
            }
        }
    }

    /// Persist the engine's combined output; a write failure only costs the
    /// log path, never the execution.
    fn write_log(&self, execution_id: i64, output: &str) -> Option<String> {
        if std::fs::create_dir_all(&self.log_dir).is_err() {
            return None;
        }
        let path = self.log_dir.join(format!("execution-{execution_id}.log"));
        match std::fs::write(&path, output) {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                tracing::warn!("Execution {execution_id}: log write failed: {e}");
                None
            }
        }
    }
}

/// Bounded worker pool over the shared dispatch queue.
pub struct WorkerPool {
    worker: Worker,
    queue: DispatchQueue,
    monitor: Arc<QueueMonitor>,
    workers: usize,
    idle_sleep: Duration,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Store,
        queue: DispatchQueue,
        monitor: Arc<QueueMonitor>,
        runner: EngineRunner,
        log_dir: PathBuf,
        config: &SchedulerConfig,
    ) -> Self {
        let workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.workers
        };
        Self {
            worker: Worker::new(store, monitor.clone(), runner, log_dir),
            queue,
            monitor,
            workers,
            idle_sleep: Duration::from_millis(config.idle_sleep_ms.max(1)),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Spawn the workers. They stop dequeuing once the shutdown signal
    /// flips; [`WorkerPool::join`] bounds the wait for in-flight runs.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!("Worker pool started ({} workers)", self.workers);
        (0..self.workers)
            .map(|n| {
                let worker = self.worker.clone();
                let queue = self.queue.clone();
                let monitor = self.monitor.clone();
                let idle_sleep = self.idle_sleep;
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match queue.dequeue().await {
                            Ok(Some(execution_id)) => {
                                monitor.record_dequeue();
                                worker.process(execution_id).await;
                            }
                            Ok(None) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(idle_sleep) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                            Err(e) => {
                                tracing::error!("Worker {n}: dequeue failed: {e}");
                                tokio::time::sleep(idle_sleep).await;
                            }
                        }
                    }
                    tracing::debug!("Worker {n} stopped");
                })
            })
            .collect()
    }

    /// Wait for the workers up to the grace period, then abort stragglers.
    pub async fn join(&self, mut handles: Vec<JoinHandle<()>>) {
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for handle in &mut handles {
            if tokio::time::timeout_at(deadline, &mut *handle).await.is_err() {
                break;
            }
        }
        let stragglers: Vec<_> = handles.iter().filter(|h| !h.is_finished()).collect();
        if !stragglers.is_empty() {
            tracing::warn!(
                "{} workers did not stop within {}s, aborting",
                stragglers.len(),
                self.shutdown_grace.as_secs()
            );
            for handle in stragglers {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerType;
    use crate::persistence::PipelineDb;
    use chrono::Utc;
    use tablift_core::config::EngineConfig;

    struct Fixture {
        store: Store,
        queue: DispatchQueue,
        monitor: Arc<QueueMonitor>,
        dir: PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("tablift-worker-{name}"));
            std::fs::remove_dir_all(&dir).ok();
            std::fs::create_dir_all(&dir).unwrap();
            let db = PipelineDb::open_in_memory().unwrap();
            Self {
                store: Store::new(&db),
                queue: DispatchQueue::new(&db),
                monitor: Arc::new(QueueMonitor::new()),
                dir,
            }
        }

        fn worker(&self, engine: &EngineConfig) -> Worker {
            Worker::new(
                self.store.clone(),
                self.monitor.clone(),
                EngineRunner::new(engine),
                self.dir.join("logs"),
            )
        }

        async fn seed(&self, timeout_secs: u64, payload: Option<serde_json::Value>) -> (i64, i64) {
            let mut task = Task::new("t", "0 * * * *");
            task.timeout_secs = timeout_secs;
            let task_id = self.store.create_task(&task).await.unwrap();
            let exec = Execution {
                id: 0,
                task_id,
                start_time: Utc::now(),
                end_time: None,
                duration_secs: None,
                status: ExecStatus::Waiting,
                trigger_type: TriggerType::Scheduled,
                payload,
                stats: None,
                log_path: None,
                error_message: None,
            };
            let exec_id = self.store.create_execution(&exec).await.unwrap();
            (task_id, exec_id)
        }

        fn cleanup(&self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    #[cfg(unix)]
    fn fake_engine(dir: &std::path::Path, script_body: &str) -> EngineConfig {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("engine").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let script = bin.join("engine.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        EngineConfig {
            home: dir.join("engine").display().to_string(),
            launcher: "bin/engine.sh".into(),
            timeout_secs: 10,
            trailer_lines: 7,
        }
    }

    #[tokio::test]
    async fn test_missing_engine_home_fails_without_spawn() {
        // Scenario E.
        let f = Fixture::new("no-home");
        let engine = EngineConfig {
            home: f.dir.join("does-not-exist").display().to_string(),
            ..EngineConfig::default()
        };
        let (task_id, exec_id) = f.seed(10, Some(serde_json::json!({}))).await;

        f.worker(&engine).process(exec_id).await;

        let exec = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecStatus::Failed);
        assert!(exec.error_message.unwrap().contains("engine home not found"));
        assert!(exec.end_time.is_some());
        let task = f.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        f.cleanup();
    }

    #[tokio::test]
    async fn test_missing_payload_is_preflight_failure() {
        let f = Fixture::new("no-payload");
        // Engine home exists; the payload sentinel must fail first anyway.
        std::fs::create_dir_all(f.dir.join("engine")).unwrap();
        let engine = EngineConfig {
            home: f.dir.join("engine").display().to_string(),
            ..EngineConfig::default()
        };
        let (_, exec_id) = f.seed(10, None).await;

        f.worker(&engine).process(exec_id).await;

        let exec = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecStatus::Failed);
        assert!(exec.error_message.unwrap().contains("no payload"));
        f.cleanup();
    }

    #[tokio::test]
    async fn test_redelivery_never_reverts_terminal() {
        let f = Fixture::new("redelivery");
        let engine = EngineConfig {
            home: f.dir.join("does-not-exist").display().to_string(),
            ..EngineConfig::default()
        };
        let (_, exec_id) = f.seed(10, Some(serde_json::json!({}))).await;
        let worker = f.worker(&engine);

        worker.process(exec_id).await;
        let first = f.store.get_execution(exec_id).await.unwrap().unwrap();

        // Simulated redelivery of the same id.
        worker.process(exec_id).await;
        let second = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(second.status, ExecStatus::Failed);
        assert_eq!(second.end_time, first.end_time);
        assert_eq!(f.monitor.snapshot(0).total_failed, 1);
        f.cleanup();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_records_stats_and_rearms_task() {
        let f = Fixture::new("success");
        let engine = fake_engine(
            &f.dir,
            "cat <<'EOT'\nJob start  at             : 2025-02-22 01:30:35\nJob end    at             : 2025-02-22 01:30:45\nJob took secs             :                  9s\nAverage   bps             :              419B/s\nAverage   rps             :              7rec/s\nNumber of rec             :                 100\nFailed record             :                   3\nEOT",
        );
        let (task_id, exec_id) = f.seed(10, Some(serde_json::json!({"job": {}}))).await;

        f.worker(&engine).process(exec_id).await;

        let exec = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecStatus::Success);
        let stats = exec.stats.unwrap();
        assert_eq!(stats.total_records, 100);
        assert_eq!(stats.success_records, 97);
        assert_eq!(stats.failed_records, 3);
        assert!(exec.log_path.is_some());
        let task = f.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(f.monitor.snapshot(0).total_succeeded, 1);
        f.cleanup();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unparseable_trailer_still_succeeds() {
        let f = Fixture::new("no-stats");
        let engine = fake_engine(&f.dir, "echo done; exit 0");
        let (_, exec_id) = f.seed(10, Some(serde_json::json!({"job": {}}))).await;

        f.worker(&engine).process(exec_id).await;

        let exec = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecStatus::Success);
        assert!(exec.stats.is_none());
        f.cleanup();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_fails_with_code() {
        let f = Fixture::new("exit-code");
        let engine = fake_engine(&f.dir, "exit 7");
        let (task_id, exec_id) = f.seed(10, Some(serde_json::json!({"job": {}}))).await;

        f.worker(&engine).process(exec_id).await;

        let exec = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecStatus::Failed);
        assert!(exec.error_message.unwrap().contains("code 7"));
        let task = f.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        f.cleanup();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_fails_with_bound_in_message() {
        // Scenario C: 2s bound, process sleeps 5s.
        let f = Fixture::new("timeout");
        let engine = fake_engine(&f.dir, "sleep 5");
        let (_, exec_id) = f.seed(2, Some(serde_json::json!({"job": {}}))).await;

        f.worker(&engine).process(exec_id).await;

        let exec = f.store.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecStatus::Failed);
        assert!(exec.error_message.unwrap().contains("timed out after 2s"));
        let tmp = std::env::temp_dir().join(format!("tablift-job-{exec_id}.json"));
        assert!(!tmp.exists());
        f.cleanup();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let f = Fixture::new("pool");
        let engine = fake_engine(&f.dir, "exit 0");
        let runner = EngineRunner::new(&engine);
        let config = SchedulerConfig {
            workers: 2,
            idle_sleep_ms: 10,
            shutdown_grace_secs: 5,
            ..SchedulerConfig::default()
        };
        let pool = WorkerPool::new(
            f.store.clone(),
            f.queue.clone(),
            f.monitor.clone(),
            runner,
            f.dir.join("logs"),
            &config,
        );

        let mut exec_ids = Vec::new();
        for name in ["a", "b"] {
            let task_id = f.store.create_task(&Task::new(name, "")).await.unwrap();
            let exec = Execution {
                id: 0,
                task_id,
                start_time: Utc::now(),
                end_time: None,
                duration_secs: None,
                status: ExecStatus::Waiting,
                trigger_type: TriggerType::Manual,
                payload: Some(serde_json::json!({"job": {}})),
                stats: None,
                log_path: None,
                error_message: None,
            };
            let exec_id = f.store.create_execution(&exec).await.unwrap();
            f.queue.enqueue(exec_id).await.unwrap();
            exec_ids.push(exec_id);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = pool.spawn(stop_rx);

        // Wait for both executions to reach a terminal state.
        for _ in 0..100 {
            let mut done = 0;
            for &id in &exec_ids {
                let exec = f.store.get_execution(id).await.unwrap().unwrap();
                if exec.status.is_terminal() {
                    done += 1;
                }
            }
            if done == exec_ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        stop_tx.send(true).unwrap();
        pool.join(handles).await;

        for &id in &exec_ids {
            let exec = f.store.get_execution(id).await.unwrap().unwrap();
            assert_eq!(exec.status, ExecStatus::Success);
        }
        assert_eq!(f.monitor.snapshot(0).total_dequeued, 2);
        f.cleanup();
    }
}
