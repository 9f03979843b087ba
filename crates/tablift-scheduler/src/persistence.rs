//! SQLite-backed persistence for the pipeline.
//! One database file holds task definitions, execution records, and the
//! durable dispatch queue — survives restarts, shared by poller and workers.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use tablift_core::{Result, TabliftError};

/// Shared handle to the pipeline database.
#[derive(Clone)]
pub struct PipelineDb {
    conn: Arc<Mutex<Connection>>,
}

impl PipelineDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TabliftError::Store(format!("DB open: {e}")))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TabliftError::Store(format!("DB open: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| TabliftError::Store(format!("Pragma: {e}")))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Recurring collection task definitions
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            cron_expression TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'NEW',
            source TEXT NOT NULL DEFAULT 'null',     -- JSON descriptor
            target TEXT NOT NULL DEFAULT 'null',     -- JSON descriptor
            timeout_secs INTEGER NOT NULL DEFAULT 7200,
            retry_times INTEGER NOT NULL DEFAULT 0,
            retry_interval_secs INTEGER NOT NULL DEFAULT 60,
            last_fire TEXT,
            next_fire TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- One row per trigger
        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_secs INTEGER,
            status TEXT NOT NULL DEFAULT 'WAITING',
            trigger_type TEXT NOT NULL DEFAULT 'SCHEDULED',
            payload TEXT,                           -- generated engine config
            total_records INTEGER,
            success_records INTEGER,
            failed_records INTEGER,
            rejected_records INTEGER,
            bytes_per_sec INTEGER,
            records_per_sec INTEGER,
            log_path TEXT,
            error_message TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        -- At most one outstanding execution per task, enforced here rather
        -- than only by the poller's check, so concurrent pollers stay safe.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_outstanding_execution
            ON executions(task_id) WHERE status IN ('WAITING', 'RUNNING');

        CREATE INDEX IF NOT EXISTS idx_executions_task_start
            ON executions(task_id, start_time DESC);

        -- Durable FIFO: the queue holds execution ids, the stores hold truth.
        CREATE TABLE IF NOT EXISTS dispatch_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id INTEGER NOT NULL
        );
        ",
    )
    .map_err(|e| TabliftError::Store(format!("Migration: {e}")))?;
    Ok(())
}
