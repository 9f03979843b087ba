//! Task and execution store — the narrow query surface the poller and
//! workers go through. All state transitions are guarded SQL updates so a
//! redelivered or stale id can never move a terminal record backwards.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use tablift_core::{Result, TabliftError};

use crate::model::{ExecStats, ExecStatus, Execution, Task, TaskStatus, TriggerType};
use crate::persistence::PipelineDb;

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn store_err(op: &str) -> impl Fn(rusqlite::Error) -> TabliftError + '_ {
    move |e| TabliftError::Store(format!("{op}: {e}"))
}

/// Durable task/execution store over the pipeline database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(db: &PipelineDb) -> Self {
        Self { conn: db.conn() }
    }

    // ─── Tasks ──────────────────────────────────────

    /// Insert a task, returning its id.
    pub async fn create_task(&self, task: &Task) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks
             (name, cron_expression, status, source, target, timeout_secs,
              retry_times, retry_interval_secs, last_fire, next_fire,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.name,
                task.cron_expression,
                task.status.code(),
                task.source.to_string(),
                task.target.to_string(),
                task.timeout_secs,
                task.retry_times,
                task.retry_interval_secs,
                task.last_fire.map(ts),
                task.next_fire.map(ts),
                ts(task.created_at),
                ts(task.updated_at),
            ],
        )
        .map_err(store_err("create task"))?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
            [id],
            row_to_task,
        )
        .optional()
        .map_err(store_err("get task"))
    }

    /// Update schedule bookkeeping and status after a dispatch decision.
    pub async fn update_task_fire(
        &self,
        id: i64,
        status: TaskStatus,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?1, last_fire = ?2, next_fire = ?3,
             updated_at = ?4 WHERE id = ?5",
            params![status.code(), last_fire.map(ts), next_fire.map(ts), ts(Utc::now()), id],
        )
        .map_err(store_err("update task fire"))?;
        Ok(())
    }

    pub async fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.code(), ts(Utc::now()), id],
        )
        .map_err(store_err("set task status"))?;
        Ok(())
    }

    /// Only update `next_fire` (initialization scan).
    pub async fn set_next_fire(&self, id: i64, next_fire: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET next_fire = ?1, updated_at = ?2 WHERE id = ?3",
            params![next_fire.map(ts), ts(Utc::now()), id],
        )
        .map_err(store_err("set next fire"))?;
        Ok(())
    }

    /// Tasks the poller considers for dispatch: New, plus Error (terminal
    /// but retryable — re-armed when its next fire arrives). Never Disabled.
    pub async fn candidate_tasks(&self) -> Result<Vec<Task>> {
        self.tasks_where("status IN ('NEW', 'ERROR')").await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.tasks_where("1 = 1").await
    }

    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.tasks_where(&format!("status = '{}'", status.code())).await
    }

    /// Tasks with a schedule but no fire bookkeeping yet.
    pub async fn tasks_needing_init(&self) -> Result<Vec<Task>> {
        self.tasks_where(
            "cron_expression != '' AND last_fire IS NULL AND next_fire IS NULL
             AND status != 'DISABLED'",
        )
        .await
    }

    async fn tasks_where(&self, cond: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks WHERE {cond} ORDER BY id"
            ))
            .map_err(store_err("prepare tasks query"))?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(store_err("tasks query"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("tasks query"))
    }

    /// Delete a task; its executions and queue entries go with it.
    pub async fn delete_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM dispatch_queue WHERE execution_id IN
             (SELECT id FROM executions WHERE task_id = ?1)",
            [id],
        )
        .map_err(store_err("delete queue entries"))?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", [id])
            .map_err(store_err("delete task"))?;
        Ok(())
    }

    // ─── Executions ──────────────────────────────────────

    /// Insert a Waiting execution. Fails when the task already has an
    /// outstanding one (the partial unique index).
    pub async fn create_execution(&self, exec: &Execution) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO executions
             (task_id, start_time, status, trigger_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                exec.task_id,
                ts(exec.start_time),
                exec.status.code(),
                exec.trigger_type.code(),
                exec.payload.as_ref().map(|p| p.to_string()),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                TabliftError::Store(format!(
                    "task {} already has an outstanding execution",
                    exec.task_id
                ))
            }
            other => TabliftError::Store(format!("create execution: {other}")),
        })?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<Execution>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {EXEC_COLS} FROM executions WHERE id = ?1"),
            [id],
            row_to_execution,
        )
        .optional()
        .map_err(store_err("get execution"))
    }

    /// Waiting→Running compare-and-set. Returns false when the execution was
    /// already claimed or is terminal — the redelivery guard.
    pub async fn claim_execution(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE executions SET status = 'RUNNING'
                 WHERE id = ?1 AND status = 'WAITING'",
                [id],
            )
            .map_err(store_err("claim execution"))?;
        Ok(n == 1)
    }

    /// Terminating transition: sets status, end time and duration exactly
    /// once. A record already terminal is left untouched (returns false).
    pub async fn finalize_execution(
        &self,
        id: i64,
        status: ExecStatus,
        stats: Option<ExecStats>,
        log_path: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let conn = self.conn.lock().await;
        let start: Option<String> = conn
            .query_row("SELECT start_time FROM executions WHERE id = ?1", [id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(store_err("finalize execution"))?;
        let Some(start) = start else {
            return Ok(false);
        };
        let end = Utc::now();
        let duration = (end - parse_ts(&start)).num_seconds().max(0);
        let n = conn
            .execute(
                "UPDATE executions SET status = ?1, end_time = ?2, duration_secs = ?3,
                 total_records = ?4, success_records = ?5, failed_records = ?6,
                 rejected_records = ?7, bytes_per_sec = ?8, records_per_sec = ?9,
                 log_path = COALESCE(?10, log_path),
                 error_message = ?11
                 WHERE id = ?12 AND status NOT IN ('SUCCESS', 'FAILED')",
                params![
                    status.code(),
                    ts(end),
                    duration,
                    stats.map(|s| s.total_records),
                    stats.map(|s| s.success_records),
                    stats.map(|s| s.failed_records),
                    stats.map(|s| s.rejected_records),
                    stats.map(|s| s.bytes_per_sec),
                    stats.map(|s| s.records_per_sec),
                    log_path,
                    error_message,
                    id,
                ],
            )
            .map_err(store_err("finalize execution"))?;
        Ok(n == 1)
    }

    /// Count of outstanding (Waiting or Running) executions for a task.
    pub async fn outstanding_count(&self, task_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM executions
             WHERE task_id = ?1 AND status IN ('WAITING', 'RUNNING')",
            [task_id],
            |r| r.get(0),
        )
        .map_err(store_err("outstanding count"))
    }

    /// Most recent execution for a task.
    pub async fn last_execution(&self, task_id: i64) -> Result<Option<Execution>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {EXEC_COLS} FROM executions WHERE task_id = ?1
                 ORDER BY start_time DESC, id DESC LIMIT 1"
            ),
            [task_id],
            row_to_execution,
        )
        .optional()
        .map_err(store_err("last execution"))
    }

    /// Recent N executions for a task, newest first.
    pub async fn recent_executions(&self, task_id: i64, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXEC_COLS} FROM executions WHERE task_id = ?1
                 ORDER BY start_time DESC, id DESC LIMIT ?2"
            ))
            .map_err(store_err("prepare recent executions"))?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], row_to_execution)
            .map_err(store_err("recent executions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("recent executions"))
    }

    pub async fn executions_by_status(&self, status: ExecStatus) -> Result<Vec<Execution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXEC_COLS} FROM executions WHERE status = ?1 ORDER BY id"
            ))
            .map_err(store_err("prepare executions by status"))?;
        let rows = stmt
            .query_map([status.code()], row_to_execution)
            .map_err(store_err("executions by status"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("executions by status"))
    }

    /// Waiting executions created before `older_than` that have lost their
    /// queue entry (enqueue failed after create, or a crash in between).
    pub async fn lost_waiting_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM executions
                 WHERE status = 'WAITING' AND start_time < ?1
                 AND id NOT IN (SELECT execution_id FROM dispatch_queue)
                 ORDER BY id",
            )
            .map_err(store_err("prepare lost waiting"))?;
        let rows = stmt
            .query_map([ts(older_than)], |r| r.get(0))
            .map_err(store_err("lost waiting"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("lost waiting"))
    }

    /// Failed executions since the task's last success — the bounded-retry
    /// policy's attempt counter.
    pub async fn failures_since_success(&self, task_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM executions
             WHERE task_id = ?1 AND status = 'FAILED'
             AND id > COALESCE(
                 (SELECT MAX(id) FROM executions
                  WHERE task_id = ?1 AND status = 'SUCCESS'), 0)",
            [task_id],
            |r| r.get(0),
        )
        .map_err(store_err("failures since success"))
    }
}

const TASK_COLS: &str = "id, name, cron_expression, status, source, target, timeout_secs, \
     retry_times, retry_interval_secs, last_fire, next_fire, created_at, updated_at";

const EXEC_COLS: &str = "id, task_id, start_time, end_time, duration_secs, status, trigger_type, \
     payload, total_records, success_records, failed_records, rejected_records, \
     bytes_per_sec, records_per_sec, log_path, error_message";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let source: String = row.get(4)?;
    let target: String = row.get(5)?;
    let last_fire: Option<String> = row.get(9)?;
    let next_fire: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expression: row.get(2)?,
        status: TaskStatus::from_code(&status).unwrap_or(TaskStatus::New),
        source: serde_json::from_str(&source).unwrap_or(serde_json::Value::Null),
        target: serde_json::from_str(&target).unwrap_or(serde_json::Value::Null),
        timeout_secs: row.get(6)?,
        retry_times: row.get(7)?,
        retry_interval_secs: row.get(8)?,
        last_fire: last_fire.as_deref().map(parse_ts),
        next_fire: next_fire.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let start_time: String = row.get(2)?;
    let end_time: Option<String> = row.get(3)?;
    let status: String = row.get(5)?;
    let trigger: String = row.get(6)?;
    let payload: Option<String> = row.get(7)?;
    let total_records: Option<i64> = row.get(8)?;
    let stats = total_records.map(|total| ExecStats {
        total_records: total,
        success_records: row.get(9).unwrap_or(Some(0)).unwrap_or(0),
        failed_records: row.get(10).unwrap_or(Some(0)).unwrap_or(0),
        rejected_records: row.get(11).unwrap_or(Some(0)).unwrap_or(0),
        bytes_per_sec: row.get(12).unwrap_or(Some(0)).unwrap_or(0),
        records_per_sec: row.get(13).unwrap_or(Some(0)).unwrap_or(0),
    });
    Ok(Execution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        start_time: parse_ts(&start_time),
        end_time: end_time.as_deref().map(parse_ts),
        duration_secs: row.get(4)?,
        status: ExecStatus::from_code(&status).unwrap_or(ExecStatus::Waiting),
        trigger_type: TriggerType::from_code(&trigger).unwrap_or(TriggerType::Scheduled),
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        stats,
        log_path: row.get(14)?,
        error_message: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::new(&PipelineDb::open_in_memory().unwrap())
    }

    fn waiting_exec(task_id: i64) -> Execution {
        Execution {
            id: 0,
            task_id,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: None,
            status: ExecStatus::Waiting,
            trigger_type: TriggerType::Scheduled,
            payload: Some(serde_json::json!({"job": {}})),
            stats: None,
            log_path: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let store = store().await;
        let id = store
            .create_task(&Task::new("orders", "*/5 * * * * *"))
            .await
            .unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.name, "orders");
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.timeout_secs, 7200);
        assert!(task.last_fire.is_none());
    }

    #[tokio::test]
    async fn test_candidates_exclude_disabled() {
        let store = store().await;
        let a = store.create_task(&Task::new("a", "0 * * * *")).await.unwrap();
        let b = store.create_task(&Task::new("b", "0 * * * *")).await.unwrap();
        let c = store.create_task(&Task::new("c", "0 * * * *")).await.unwrap();
        store.set_task_status(b, TaskStatus::Disabled).await.unwrap();
        store.set_task_status(c, TaskStatus::Error).await.unwrap();

        let ids: Vec<i64> = store
            .candidate_tasks()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[tokio::test]
    async fn test_second_outstanding_insert_rejected() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        store.create_execution(&waiting_exec(task)).await.unwrap();
        // The partial unique index rejects a second non-terminal row.
        assert!(store.create_execution(&waiting_exec(task)).await.is_err());
        assert_eq!(store.outstanding_count(task).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outstanding_allows_new_after_terminal() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        let e1 = store.create_execution(&waiting_exec(task)).await.unwrap();
        assert!(store.claim_execution(e1).await.unwrap());
        assert!(store
            .finalize_execution(e1, ExecStatus::Success, None, None, None)
            .await
            .unwrap());
        // Terminal row no longer blocks.
        store.create_execution(&waiting_exec(task)).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        let exec = store.create_execution(&waiting_exec(task)).await.unwrap();
        assert!(store.claim_execution(exec).await.unwrap());
        // Redelivery: second claim must not succeed.
        assert!(!store.claim_execution(exec).await.unwrap());
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        let exec = store.create_execution(&waiting_exec(task)).await.unwrap();
        store.claim_execution(exec).await.unwrap();
        assert!(store
            .finalize_execution(exec, ExecStatus::Failed, None, None, Some("boom"))
            .await
            .unwrap());
        // Terminal status is never overwritten.
        assert!(!store
            .finalize_execution(exec, ExecStatus::Success, None, None, None)
            .await
            .unwrap());

        let row = store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(row.status, ExecStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert!(row.end_time.is_some());
        assert!(row.duration_secs.is_some());
    }

    #[tokio::test]
    async fn test_finalize_records_stats() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        let exec = store.create_execution(&waiting_exec(task)).await.unwrap();
        store.claim_execution(exec).await.unwrap();
        let stats = ExecStats {
            total_records: 100,
            success_records: 97,
            failed_records: 3,
            rejected_records: 0,
            bytes_per_sec: 419,
            records_per_sec: 7,
        };
        store
            .finalize_execution(exec, ExecStatus::Success, Some(stats), Some("/tmp/x.log"), None)
            .await
            .unwrap();
        let row = store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(row.stats, Some(stats));
        assert_eq!(row.log_path.as_deref(), Some("/tmp/x.log"));
    }

    #[tokio::test]
    async fn test_recent_executions_newest_first() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        for _ in 0..3 {
            let e = store.create_execution(&waiting_exec(task)).await.unwrap();
            store.claim_execution(e).await.unwrap();
            store
                .finalize_execution(e, ExecStatus::Success, None, None, None)
                .await
                .unwrap();
        }
        let recent = store.recent_executions(task, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].id > recent[1].id);
    }

    #[tokio::test]
    async fn test_delete_task_cascades() {
        let db = PipelineDb::open_in_memory().unwrap();
        let store = Store::new(&db);
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        let exec = store.create_execution(&waiting_exec(task)).await.unwrap();
        store.delete_task(task).await.unwrap();
        assert!(store.get_execution(exec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failures_since_success() {
        let store = store().await;
        let task = store.create_task(&Task::new("t", "0 * * * *")).await.unwrap();
        for status in [ExecStatus::Success, ExecStatus::Failed, ExecStatus::Failed] {
            let e = store.create_execution(&waiting_exec(task)).await.unwrap();
            store.claim_execution(e).await.unwrap();
            store.finalize_execution(e, status, None, None, None).await.unwrap();
        }
        assert_eq!(store.failures_since_success(task).await.unwrap(), 2);
    }
}
