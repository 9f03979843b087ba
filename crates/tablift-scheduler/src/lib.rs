//! # Tablift Scheduler
//!
//! The job/task scheduling and execution pipeline: decides *when* a
//! collection task is due, guarantees at most one outstanding run per task,
//! hands work to a durable queue, executes it through the external ETL
//! engine with timeout and retry policy, and records the outcome with parsed
//! performance statistics.
//!
//! ## Architecture
//! ```text
//! Poller (5s tick)
//!   ├── due-check: cron next-fire vs now, outstanding-execution guard
//!   ├── create Execution (WAITING) + store engine config payload
//!   └── enqueue execution id → DispatchQueue (durable FIFO, SQLite)
//!
//! WorkerPool (N workers)
//!   ├── dequeue id → claim (WAITING→RUNNING compare-and-set)
//!   ├── EngineRunner: temp config file → launcher script → bounded wait
//!   ├── parse statistics trailer (last N lines)
//!   └── finalize: SUCCESS / FAILED (end time + duration set exactly once)
//!
//! QueueMonitor — injected atomic counters + bounded depth history
//! ```

pub mod cron;
pub mod generator;
pub mod model;
pub mod monitor;
pub mod persistence;
pub mod poller;
pub mod queue;
pub mod runner;
pub mod store;
pub mod worker;

pub use cron::{Schedule, ScheduleError};
pub use generator::{ConfigGenerator, TemplateGenerator};
pub use model::{ExecStats, ExecStatus, Execution, Task, TaskStatus, TriggerType};
pub use monitor::{QueueMonitor, QueueStats};
pub use persistence::PipelineDb;
pub use poller::Poller;
pub use queue::DispatchQueue;
pub use runner::{EngineRunner, RunOutput, RunnerError};
pub use store::Store;
pub use worker::{Worker, WorkerPool};
