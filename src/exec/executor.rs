//! Script Executor
//!
//! Runs a whitelisted action script as a child process. The script path comes
//! from the [`ActionRegistry`]; arguments are passed as a discrete vector and
//! never through a shell command line. Output is captured up to a size cap,
//! and a child that outlives the timeout is killed with whatever it printed so
//! far attached to the error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sanitize::filter_safe;
use crate::actions::{Action, ActionRegistry, Platform};
use crate::metrics;

/// Default timeout for a script run in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Maximum captured bytes per stream (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// How long to wait for pipes to drain after the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const TRUNCATED_MARKER: &str = "...[truncated]";

/// Captured standard streams of a script run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// A script run that did not complete successfully
///
/// Every variant carries the output captured before the failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to start {}: {message}", script.display())]
    Spawn {
        script: PathBuf,
        message: String,
        output: ScriptOutput,
    },

    #[error("script timed out after {}s", timeout.as_secs())]
    TimedOut {
        timeout: Duration,
        output: ScriptOutput,
    },

    #[error("script exited with {}", exit_label(*code))]
    NonZeroExit {
        code: Option<i32>,
        output: ScriptOutput,
    },

    #[error("i/o error while running script: {message}")]
    Io {
        message: String,
        output: ScriptOutput,
    },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl ExecutionError {
    /// Output captured before the failure
    pub fn output(&self) -> &ScriptOutput {
        match self {
            ExecutionError::Spawn { output, .. }
            | ExecutionError::TimedOut { output, .. }
            | ExecutionError::NonZeroExit { output, .. }
            | ExecutionError::Io { output, .. } => output,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::TimedOut { .. })
    }
}

/// Configuration for script execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock limit per run (default: 60 seconds)
    pub timeout: Duration,

    /// Maximum captured bytes per stream (default: 1MB)
    pub max_output_size: usize,

    /// Working directory for the child (default: inherited)
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_size: MAX_OUTPUT_SIZE,
            working_dir: None,
        }
    }
}

impl ExecutorConfig {
    /// Default config with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Default config with a custom output cap
    pub fn with_max_output_size(size: usize) -> Self {
        Self {
            max_output_size: size,
            ..Default::default()
        }
    }
}

/// Something that can run a whitelisted action
///
/// The command handler only talks to this trait so tests can substitute a
/// mock for real process spawning.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `action` with `args`, returning its output or the failure
    async fn run_script_safe(
        &self,
        action: Action,
        args: &[String],
    ) -> Result<ScriptOutput, ExecutionError>;

    /// Platform whose script variant this runner uses
    fn platform(&self) -> Platform {
        Platform::current()
    }

    /// Script that would run for `action`
    fn script_path(&self, action: Action) -> PathBuf;
}

/// Process-spawning [`ScriptRunner`]
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    registry: Arc<ActionRegistry>,
    config: ExecutorConfig,
    platform: Platform,
}

impl ScriptExecutor {
    pub fn new(registry: Arc<ActionRegistry>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            config,
            platform: Platform::current(),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn build_command(&self, script: &Path, args: &[String]) -> TokioCommand {
        let mut process = match self.platform {
            Platform::Windows => {
                let mut cmd = TokioCommand::new("powershell.exe");
                cmd.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
                    .arg(script);
                cmd
            }
            Platform::Unix => TokioCommand::new(script),
        };
        process.args(args);

        if let Some(ref dir) = self.config.working_dir {
            process.current_dir(dir);
        }

        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process
    }

    async fn run(&self, action: Action, args: &[String]) -> Result<ScriptOutput, ExecutionError> {
        let script = self.registry.script_path(action, self.platform);
        // Relative script paths must not be re-resolved against working_dir
        let script = std::path::absolute(script).unwrap_or_else(|_| script.to_path_buf());

        info!(
            action = %action,
            script = %script.display(),
            args = args.len(),
            "Executing action script"
        );

        let mut child = self
            .build_command(&script, args)
            .spawn()
            .map_err(|e| ExecutionError::Spawn {
                script: script.clone(),
                message: e.to_string(),
                output: ScriptOutput::default(),
            })?;

        let cap = self.config.max_output_size;
        let stdout = StreamCapture::spawn(child.stdout.take(), cap);
        let stderr = StreamCapture::spawn(child.stderr.take(), cap);

        let waited = tokio::time::timeout(self.config.timeout, child.wait()).await;

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let output = collect(stdout, stderr).await;
                return Err(ExecutionError::Io {
                    message: e.to_string(),
                    output,
                });
            }
            Err(_) => {
                warn!(action = %action, "Script timed out after {:?}, killing", self.config.timeout);
                if let Err(e) = child.kill().await {
                    warn!(action = %action, "Failed to kill timed out script: {}", e);
                }
                let output = collect(stdout, stderr).await;
                return Err(ExecutionError::TimedOut {
                    timeout: self.config.timeout,
                    output,
                });
            }
        };

        let output = collect(stdout, stderr).await;
        if status.success() {
            debug!(action = %action, "Script succeeded");
            Ok(output)
        } else {
            warn!(action = %action, "Script failed (exit code: {:?})", status.code());
            Err(ExecutionError::NonZeroExit {
                code: status.code(),
                output,
            })
        }
    }
}

#[async_trait]
impl ScriptRunner for ScriptExecutor {
    /// Re-filters `args` so callers cannot bypass sanitization
    async fn run_script_safe(
        &self,
        action: Action,
        args: &[String],
    ) -> Result<ScriptOutput, ExecutionError> {
        let args = filter_safe(args);
        let start = Instant::now();
        let result = self.run(action, &args).await;
        metrics::observe_script(action.name(), result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn script_path(&self, action: Action) -> PathBuf {
        self.registry.script_path(action, self.platform).to_path_buf()
    }
}

/// Background reader collecting one child stream into a capped buffer
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    cap: usize,
}

impl StreamCapture {
    fn spawn<R>(reader: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|reader| {
            let buf = buf.clone();
            // One byte past the cap marks the stream as truncated
            tokio::spawn(read_capped(reader, buf, cap.saturating_add(1)))
        });
        Self { buf, task, cap }
    }

    /// Wait briefly for EOF, then take what was read
    ///
    /// Grandchildren can hold the pipe open after the script is killed, so
    /// the reader is abandoned after [`DRAIN_GRACE`].
    async fn finish(self) -> String {
        if let Some(mut task) = self.task {
            if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        let bytes = std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner));
        truncate_output(&bytes, self.cap)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>, limit: usize) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut buf = buf.lock().unwrap_or_else(PoisonError::into_inner);
        let room = limit.saturating_sub(buf.len());
        // Keep draining past the limit so the child never blocks on a full pipe
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
}

async fn collect(stdout: StreamCapture, stderr: StreamCapture) -> ScriptOutput {
    let (stdout, stderr) = tokio::join!(stdout.finish(), stderr.finish());
    ScriptOutput { stdout, stderr }
}

/// Decode captured bytes, marking output that exceeded `cap`
fn truncate_output(bytes: &[u8], cap: usize) -> String {
    if bytes.len() > cap {
        let mut s = String::from_utf8_lossy(&bytes[..cap]).into_owned();
        s.push_str(TRUNCATED_MARKER);
        s
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test the truncation marker
    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output(b"hello", 10), "hello");
        assert_eq!(truncate_output(b"hello", 5), "hello");
        assert_eq!(truncate_output(b"hello world", 5), "hello...[truncated]");
        assert_eq!(truncate_output(b"", 10), "");
    }

    /// Test error output accessor and messages
    #[test]
    fn test_execution_error_output() {
        let err = ExecutionError::NonZeroExit {
            code: Some(2),
            output: ScriptOutput::new("partial", "boom"),
        };
        assert_eq!(err.output().stderr, "boom");
        assert_eq!(err.to_string(), "script exited with code 2");
        assert!(!err.is_timeout());

        let err = ExecutionError::TimedOut {
            timeout: Duration::from_secs(60),
            output: ScriptOutput::default(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "script timed out after 60s");
    }

    /// Test ExecutorConfig defaults
    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_output_size, 1024 * 1024);
        assert!(config.working_dir.is_none());

        let config = ExecutorConfig::with_timeout(Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(ExecutorConfig::with_max_output_size(10).max_output_size, 10);
    }

    /// Test that a missing script surfaces as a spawn error
    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_script_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ActionRegistry::new(dir.path()));
        let executor = ScriptExecutor::new(registry, ExecutorConfig::default());

        let err = executor
            .run_script_safe(Action::Deploy, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
        assert_eq!(err.output(), &ScriptOutput::default());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &Path, name: &str, body: &str) {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn executor(dir: &Path, config: ExecutorConfig) -> ScriptExecutor {
            ScriptExecutor::new(Arc::new(ActionRegistry::new(dir)), config)
        }

        /// Test a successful run passes args as discrete argv entries
        #[tokio::test]
        async fn test_success_captures_stdout_and_args() {
            let dir = tempfile::tempdir().unwrap();
            write_script(
                dir.path(),
                "restart-service.sh",
                r#"echo "restarting $1"; echo "argc=$#"; echo warn >&2"#,
            );
            let exec = executor(dir.path(), ExecutorConfig::default());

            let out = exec
                .run_script_safe(Action::RestartService, &["nginx".to_string()])
                .await
                .unwrap();
            assert_eq!(out.stdout, "restarting nginx\nargc=1\n");
            assert_eq!(out.stderr, "warn\n");
        }

        /// Test unsafe args are dropped before the child sees them
        #[tokio::test]
        async fn test_unsafe_args_dropped() {
            let dir = tempfile::tempdir().unwrap();
            write_script(dir.path(), "fetch-logs.sh", r#"echo "argc=$# first=$1""#);
            let exec = executor(dir.path(), ExecutorConfig::default());

            let args = vec![
                "x; rm -rf /".to_string(),
                "app.log".to_string(),
                "$(id)".to_string(),
            ];
            let out = exec
                .run_script_safe(Action::FetchLogs, &args)
                .await
                .unwrap();
            assert_eq!(out.stdout, "argc=1 first=app.log\n");
        }

        /// Test non-zero exit keeps output
        #[tokio::test]
        async fn test_non_zero_exit() {
            let dir = tempfile::tempdir().unwrap();
            write_script(dir.path(), "deploy.sh", "echo building; echo failed >&2; exit 3");
            let exec = executor(dir.path(), ExecutorConfig::default());

            let err = exec.run_script_safe(Action::Deploy, &[]).await.unwrap_err();
            match err {
                ExecutionError::NonZeroExit { code, output } => {
                    assert_eq!(code, Some(3));
                    assert_eq!(output.stdout, "building\n");
                    assert_eq!(output.stderr, "failed\n");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        /// Test timeout kills the script and keeps partial output
        #[tokio::test]
        async fn test_timeout_keeps_partial_output() {
            let dir = tempfile::tempdir().unwrap();
            write_script(dir.path(), "deploy.sh", "echo started; exec sleep 30");
            let exec = executor(
                dir.path(),
                ExecutorConfig::with_timeout(Duration::from_millis(300)),
            );

            let start = Instant::now();
            let err = exec.run_script_safe(Action::Deploy, &[]).await.unwrap_err();
            assert!(err.is_timeout());
            assert_eq!(err.output().stdout, "started\n");
            assert!(start.elapsed() < Duration::from_secs(10));
        }

        /// Test output is capped
        #[tokio::test]
        async fn test_output_truncation() {
            let dir = tempfile::tempdir().unwrap();
            write_script(dir.path(), "fetch-logs.sh", "seq 1 1000");
            let exec = executor(dir.path(), ExecutorConfig::with_max_output_size(100));

            let out = exec.run_script_safe(Action::FetchLogs, &[]).await.unwrap();
            assert!(out.stdout.ends_with(TRUNCATED_MARKER));
            assert_eq!(out.stdout.len(), 100 + TRUNCATED_MARKER.len());
        }

        /// Test working directory is applied while the script path stays fixed
        #[tokio::test]
        async fn test_working_directory() {
            let dir = tempfile::tempdir().unwrap();
            let work = tempfile::tempdir().unwrap();
            write_script(dir.path(), "fetch-logs.sh", "pwd");
            let config = ExecutorConfig {
                working_dir: Some(work.path().to_path_buf()),
                ..Default::default()
            };
            let exec = executor(dir.path(), config);

            let out = exec.run_script_safe(Action::FetchLogs, &[]).await.unwrap();
            let expected = work.path().canonicalize().unwrap();
            assert_eq!(Path::new(out.stdout.trim()).canonicalize().unwrap(), expected);
        }
    }
}
