//! # Tablift Core
//!
//! Shared plumbing for the tablift pipeline: the configuration file and the
//! crate-wide error type. Everything else lives in `tablift-scheduler`.

pub mod config;
pub mod error;

pub use config::TabliftConfig;
pub use error::{Result, TabliftError};
