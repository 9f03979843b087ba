//! Dispatch queue — a durable FIFO decoupling "a task became due" from
//! "a worker is free to run it". The payload is the execution id only:
//! the queue holds references, the stores hold truth.
//!
//! Backed by the pipeline database so queued work survives restarts.
//! Dequeue is non-blocking; workers poll with a short sleep when empty.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use tablift_core::{Result, TabliftError};

use crate::persistence::PipelineDb;

/// Durable FIFO of execution ids.
#[derive(Clone)]
pub struct DispatchQueue {
    conn: Arc<Mutex<Connection>>,
}

impl DispatchQueue {
    pub fn new(db: &PipelineDb) -> Self {
        Self { conn: db.conn() }
    }

    /// Push an execution id onto the tail.
    pub async fn enqueue(&self, execution_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO dispatch_queue (execution_id) VALUES (?1)",
            [execution_id],
        )
        .map_err(|e| TabliftError::Queue(format!("enqueue: {e}")))?;
        Ok(())
    }

    /// Pop the oldest entry, or None when empty.
    pub async fn dequeue(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let head: Option<(i64, i64)> = conn
            .query_row(
                "SELECT seq, execution_id FROM dispatch_queue ORDER BY seq LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| TabliftError::Queue(format!("dequeue: {e}")))?;
        let Some((seq, execution_id)) = head else {
            return Ok(None);
        };
        conn.execute("DELETE FROM dispatch_queue WHERE seq = ?1", [seq])
            .map_err(|e| TabliftError::Queue(format!("dequeue delete: {e}")))?;
        Ok(Some(execution_id))
    }

    /// Current depth.
    pub async fn len(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM dispatch_queue", [], |r| r.get(0))
            .map_err(|e| TabliftError::Queue(format!("len: {e}")))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let db = PipelineDb::open_in_memory().unwrap();
        let queue = DispatchQueue::new(&db);
        for id in [11, 22, 33] {
            queue.enqueue(id).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);
        assert_eq!(queue.dequeue().await.unwrap(), Some(11));
        assert_eq!(queue.dequeue().await.unwrap(), Some(22));
        assert_eq!(queue.dequeue().await.unwrap(), Some(33));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = std::env::temp_dir().join("tablift-queue-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("queue.db");
        std::fs::remove_file(&path).ok();
        {
            let db = PipelineDb::open(&path).unwrap();
            DispatchQueue::new(&db).enqueue(7).await.unwrap();
        }
        let db = PipelineDb::open(&path).unwrap();
        let queue = DispatchQueue::new(&db);
        assert_eq!(queue.dequeue().await.unwrap(), Some(7));
        std::fs::remove_dir_all(&dir).ok();
    }
}
