//! Process runner — wraps the external ETL engine's command-line
//! invocation: config payload to a temp file, launcher script, merged
//! output capture, bounded wait with forced kill, and the statistics
//! trailer parser.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use tablift_core::config::EngineConfig;

use crate::model::ExecStats;

/// Engine invocation failure.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Launcher script missing — no process was spawned.
    #[error("engine launcher not found: {0}")]
    Preflight(String),

    #[error("failed to spawn engine process: {0}")]
    Spawn(String),

    /// Process exceeded its bound and was force-killed.
    #[error("engine process timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a completed (non-timed-out) engine run.
#[derive(Debug)]
pub struct RunOutput {
    pub exit_code: i32,
    /// stdout then stderr, merged.
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Removes the temp config file on every exit path, including timeout,
/// kill, and error returns.
struct TempConfigFile {
    path: PathBuf,
}

impl TempConfigFile {
    fn write(execution_id: i64, payload: &serde_json::Value) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("tablift-job-{execution_id}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(payload).unwrap_or_default())?;
        Ok(Self { path })
    }
}

impl Drop for TempConfigFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove temp config {}: {e}", self.path.display());
            }
        }
    }
}

/// Runs the engine launcher with one config-file argument.
#[derive(Clone)]
pub struct EngineRunner {
    home: PathBuf,
    launcher: PathBuf,
    trailer_lines: usize,
}

impl EngineRunner {
    pub fn new(config: &EngineConfig) -> Self {
        let home = PathBuf::from(&config.home);
        let launcher = home.join(&config.launcher);
        Self {
            home,
            launcher,
            trailer_lines: config.trailer_lines,
        }
    }

    /// Engine installation directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn home_exists(&self) -> bool {
        self.home.exists()
    }

    /// Execute the engine for one execution.
    pub async fn run(
        &self,
        execution_id: i64,
        payload: &serde_json::Value,
        timeout_secs: u64,
    ) -> Result<RunOutput, RunnerError> {
        if !self.launcher.exists() {
            return Err(RunnerError::Preflight(self.launcher.display().to_string()));
        }

        let config_file = TempConfigFile::write(execution_id, payload)?;

        let mut child = Command::new(&self.launcher)
            .arg(&config_file.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        // Drain both pipes while waiting, so a chatty engine can't fill the
        // pipe buffer and deadlock.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                tracing::warn!(
                    "Engine run {execution_id} exceeded {timeout_secs}s, killing"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                // config_file dropped here: temp file removed on the kill path too
                return Err(RunnerError::Timeout { secs: timeout_secs });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let mut output = stdout;
        output.push_str(&stderr);

        Ok(RunOutput {
            exit_code: status.code().unwrap_or(-1),
            output,
        })
    }

    /// Parse the statistics trailer from a run's output.
    pub fn parse_stats(&self, output: &str) -> Option<ExecStats> {
        parse_trailer(output, self.trailer_lines)
    }
}

/// Extract statistics from the engine's fixed-format trailer:
///
/// ```text
/// Job start  at             : 2025-02-22 01:30:35
/// Job end    at             : 2025-02-22 01:30:45
/// Job took secs             :                  9s
/// Average   bps             :              419B/s
/// Average   rps             :              7rec/s
/// Number of rec             :                  21
/// Failed record             :                   0
/// ```
///
/// The trailer is located by taking the LAST `trailer_lines` lines — never
/// by scanning for a marker. Each line splits on its first colon; the value
/// drops its unit token. Any parse failure yields `None`: the caller treats
/// that as success with unknown statistics, not as an execution failure.
pub fn parse_trailer(output: &str, trailer_lines: usize) -> Option<ExecStats> {
    if trailer_lines < 5 {
        return None;
    }
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() < trailer_lines {
        return None;
    }
    let tail = &lines[lines.len() - trailer_lines..];

    // Numeric fields sit at fixed positions from the trailer's end.
    let bytes_per_sec = numeric_value(tail[trailer_lines - 4])?;
    let records_per_sec = numeric_value(tail[trailer_lines - 3])?;
    let total_records = numeric_value(tail[trailer_lines - 2])?;
    let failed_records = numeric_value(tail[trailer_lines - 1])?;

    Some(ExecStats {
        total_records,
        success_records: total_records - failed_records,
        failed_records,
        rejected_records: 0,
        bytes_per_sec,
        records_per_sec,
    })
}

/// Value after the first colon, with unit tokens (`B/s`, `rec/s`, `s`)
/// stripped.
fn numeric_value(line: &str) -> Option<i64> {
    let (_, value) = line.split_once(':')?;
    let mut value = value.trim();
    for unit in ["B/s", "rec/s"] {
        value = value.strip_suffix(unit).unwrap_or(value);
    }
    value = value.strip_suffix('s').unwrap_or(value).trim();
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAILER: &str = "\
Job start  at             : 2025-02-22 01:30:35
Job end    at             : 2025-02-22 01:30:45
Job took secs             :                  9s
Average   bps             :              419B/s
Average   rps             :              7rec/s
Number of rec             :                 100
Failed record             :                   3";

    #[test]
    fn test_parse_trailer() {
        let output = format!("2025-02-22 engine starting\nsome noisy log line\n{TRAILER}");
        let stats = parse_trailer(&output, 7).unwrap();
        assert_eq!(stats.total_records, 100);
        assert_eq!(stats.failed_records, 3);
        assert_eq!(stats.success_records, 97);
        assert_eq!(stats.bytes_per_sec, 419);
        assert_eq!(stats.records_per_sec, 7);
        // Round-trip invariant
        assert_eq!(
            stats.total_records,
            stats.success_records + stats.failed_records
        );
    }

    #[test]
    fn test_garbage_output_degrades_to_none() {
        assert!(parse_trailer("oops, engine crashed\nstack trace here", 7).is_none());
        assert!(parse_trailer("", 7).is_none());
        let not_numbers = "a: x\nb: y\nc: z\nd: w\ne: v\nf: u\ng: t";
        assert!(parse_trailer(not_numbers, 7).is_none());
    }

    #[test]
    fn test_trailer_is_positional_not_marker_based() {
        // A "Number of rec" line earlier in the log must not be picked up.
        let output = format!("Number of rec             :             999999\n{TRAILER}");
        let stats = parse_trailer(&output, 7).unwrap();
        assert_eq!(stats.total_records, 100);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_engine(dir: &std::path::Path, script_body: &str) -> EngineConfig {
            let bin = dir.join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            let script = bin.join("engine.sh");
            std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            EngineConfig {
                home: dir.display().to_string(),
                launcher: "bin/engine.sh".into(),
                timeout_secs: 10,
                trailer_lines: 7,
            }
        }

        fn temp_config_path(execution_id: i64) -> std::path::PathBuf {
            std::env::temp_dir().join(format!("tablift-job-{execution_id}.json"))
        }

        #[tokio::test]
        async fn test_successful_run_captures_output() {
            let dir = std::env::temp_dir().join("tablift-runner-ok");
            let config = fake_engine(&dir, "echo hello from engine");
            let runner = EngineRunner::new(&config);
            let out = runner
                .run(9001, &serde_json::json!({"job": {}}), 10)
                .await
                .unwrap();
            assert!(out.success());
            assert!(out.output.contains("hello from engine"));
            assert!(!temp_config_path(9001).exists());
            std::fs::remove_dir_all(&dir).ok();
        }

        #[tokio::test]
        async fn test_nonzero_exit_reported() {
            let dir = std::env::temp_dir().join("tablift-runner-fail");
            let config = fake_engine(&dir, "echo boom >&2; exit 3");
            let runner = EngineRunner::new(&config);
            let out = runner
                .run(9002, &serde_json::json!({"job": {}}), 10)
                .await
                .unwrap();
            assert_eq!(out.exit_code, 3);
            assert!(out.output.contains("boom"));
            std::fs::remove_dir_all(&dir).ok();
        }

        #[tokio::test]
        async fn test_timeout_kills_and_cleans_temp_file() {
            let dir = std::env::temp_dir().join("tablift-runner-timeout");
            let config = fake_engine(&dir, "sleep 5");
            let runner = EngineRunner::new(&config);
            let err = runner
                .run(9003, &serde_json::json!({"job": {}}), 2)
                .await
                .unwrap_err();
            match err {
                RunnerError::Timeout { secs } => assert_eq!(secs, 2),
                other => panic!("expected timeout, got {other:?}"),
            }
            assert!(!temp_config_path(9003).exists());
            std::fs::remove_dir_all(&dir).ok();
        }

        #[tokio::test]
        async fn test_missing_launcher_is_preflight() {
            let dir = std::env::temp_dir().join("tablift-runner-missing");
            std::fs::create_dir_all(&dir).ok();
            let config = EngineConfig {
                home: dir.display().to_string(),
                launcher: "bin/engine.sh".into(),
                timeout_secs: 10,
                trailer_lines: 7,
            };
            let runner = EngineRunner::new(&config);
            let err = runner
                .run(9004, &serde_json::json!({"job": {}}), 10)
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::Preflight(_)));
            std::fs::remove_dir_all(&dir).ok();
        }

        #[tokio::test]
        async fn test_engine_with_trailer_end_to_end() {
            let dir = std::env::temp_dir().join("tablift-runner-trailer");
            let config = fake_engine(
                &dir,
                "cat <<'EOT'\nengine log line\nJob start  at             : 2025-02-22 01:30:35\nJob end    at             : 2025-02-22 01:30:45\nJob took secs             :                  9s\nAverage   bps             :              419B/s\nAverage   rps             :              7rec/s\nNumber of rec             :                  21\nFailed record             :                   0\nEOT",
            );
            let runner = EngineRunner::new(&config);
            let out = runner
                .run(9005, &serde_json::json!({"job": {}}), 10)
                .await
                .unwrap();
            let stats = runner.parse_stats(&out.output).unwrap();
            assert_eq!(stats.total_records, 21);
            assert_eq!(stats.success_records, 21);
            std::fs::remove_dir_all(&dir).ok();
        }
    }
}
