use crate::logging::Logger;
use crate::osproc;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Reported when the child never ran (spawn failure, terminated during the
/// startup delay).
pub const ERROR_EXIT_CODE: i32 = 255;

pub const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("manually terminated")]
    ManuallyTerminated,
    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ExecConfig {
    pub path: String,
    pub args: Vec<String>,
    /// Extra variables on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub startup_delay: Duration,
    /// Zero disables the timeout.
    pub exec_timeout: Duration,
    pub graceful_shutdown: Duration,
    /// Line sink for captured stdout/stderr. None lets the child inherit the
    /// parent's stdio (console mode).
    pub logger: Option<Logger>,
}

impl ExecConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
            startup_delay: Duration::ZERO,
            exec_timeout: Duration::ZERO,
            graceful_shutdown: DEFAULT_GRACEFUL_SHUTDOWN,
            logger: None,
        }
    }
}

pub fn exe_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// ---------------------------------------------------------------------------
// Executable
// ---------------------------------------------------------------------------

/// A configured child execution. Layered policies, innermost to outermost:
/// base spawn with graceful-kill-on-terminate, startup delay, exec timeout
/// (the timeout fires on a derived token so the base sees a single
/// cancellation signal).
pub struct Executable {
    config: ExecConfig,
}

impl Executable {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, terminate: &CancellationToken) -> Result<i32, ExecError> {
        let term = if self.config.exec_timeout > Duration::ZERO {
            // The budget includes the startup delay so the child is still
            // guaranteed exec_timeout of actual runtime.
            let budget = self.config.exec_timeout + self.config.startup_delay;
            let derived = CancellationToken::new();
            let parent = terminate.clone();
            let fire = derived.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.cancelled() => {}
                    _ = tokio::time::sleep(budget) => {}
                }
                fire.cancel();
            });
            derived
        } else {
            terminate.clone()
        };

        if self.config.startup_delay > Duration::ZERO {
            tokio::select! {
                _ = term.cancelled() => return Err(ExecError::ManuallyTerminated),
                _ = tokio::time::sleep(self.config.startup_delay) => {}
            }
        }

        self.run_child(&term).await
    }

    async fn run_child(&self, terminate: &CancellationToken) -> Result<i32, ExecError> {
        let mut cmd = tokio::process::Command::new(&self.config.path);
        cmd.args(&self.config.args);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        if self.config.logger.is_some() {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        osproc::apply_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
        let pid = child.id();
        let name = exe_name(&self.config.path);

        let mut copiers = Vec::new();
        if let Some(logger) = &self.config.logger {
            if let Some(stdout) = child.stdout.take() {
                copiers.push(spawn_line_copier(
                    stdout,
                    logger.clone(),
                    format!("{name}: STDOUT|"),
                ));
            }
            if let Some(stderr) = child.stderr.take() {
                copiers.push(spawn_line_copier(
                    stderr,
                    logger.clone(),
                    format!("{name}: STDERR|"),
                ));
            }
        }

        // Companion task: on terminate, walk the child down gracefully.
        let complete = CancellationToken::new();
        let killer = {
            let term = terminate.clone();
            let complete = complete.clone();
            let graceful = self.config.graceful_shutdown;
            tokio::spawn(async move {
                tokio::select! {
                    _ = term.cancelled() => {
                        if let Some(pid) = pid {
                            let _ = osproc::kill_gracefully(pid, graceful).await;
                        }
                    }
                    _ = complete.cancelled() => {}
                }
            })
        };

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(0),
            Err(_) => ERROR_EXIT_CODE,
        };

        complete.cancel();
        let _ = killer.await;
        // Drain the pipe readers so every line reaches the logger before we
        // report the exit.
        for copier in copiers {
            let _ = copier.await;
        }

        Ok(code)
    }
}

// ---------------------------------------------------------------------------
// Line-buffered capture
// ---------------------------------------------------------------------------

/// Forward each complete line to the logger with the stream prefix. A
/// partial trailing line is held until a newline arrives or the stream
/// closes, then forwarded as-is.
fn spawn_line_copier(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    logger: Logger,
    prefix: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = line.trim_end_matches(['\r', '\n']);
                    logger.log(&format!("{prefix}{text}"));
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> ExecConfig {
        let mut config = ExecConfig::new("sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config
    }

    #[tokio::test]
    async fn test_exit_code_zero() {
        let exe = Executable::new(sh("exit 0"));
        let code = exe.execute(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_exit_code_propagated() {
        let exe = Executable::new(sh("exit 3"));
        let code = exe.execute(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let exe = Executable::new(ExecConfig::new("/no/such/binary"));
        let result = exe.execute(&CancellationToken::new()).await;
        assert!(matches!(result, Err(ExecError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_stdout_lines_prefixed() {
        let mut config = sh("echo one; echo two");
        let (logger, lines) = Logger::memory();
        config.logger = Some(logger);

        Executable::new(config).execute(&CancellationToken::new()).await.unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.as_slice(), ["sh: STDOUT|one", "sh: STDOUT|two"]);
    }

    #[tokio::test]
    async fn test_stderr_lines_prefixed_separately() {
        let mut config = sh("echo out; echo err >&2");
        let (logger, lines) = Logger::memory();
        config.logger = Some(logger);

        Executable::new(config).execute(&CancellationToken::new()).await.unwrap();

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&"sh: STDOUT|out".to_string()));
        assert!(lines.contains(&"sh: STDERR|err".to_string()));
    }

    #[tokio::test]
    async fn test_partial_trailing_line_forwarded() {
        let mut config = sh("printf 'no-newline'");
        let (logger, lines) = Logger::memory();
        config.logger = Some(logger);

        Executable::new(config).execute(&CancellationToken::new()).await.unwrap();

        assert_eq!(lines.lock().unwrap().as_slice(), ["sh: STDOUT|no-newline"]);
    }

    #[tokio::test]
    async fn test_terminate_during_startup_delay_skips_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let mut config = sh(&format!("touch {}", marker.display()));
        config.startup_delay = Duration::from_secs(5);

        let terminate = CancellationToken::new();
        let cancel = terminate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let result = Executable::new(config).execute(&terminate).await;
        assert!(matches!(result, Err(ExecError::ManuallyTerminated)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!marker.exists(), "child must never have spawned");
    }

    #[tokio::test]
    async fn test_startup_delay_respected() {
        let mut config = sh("exit 0");
        config.startup_delay = Duration::from_millis(400);

        let start = Instant::now();
        let code = Executable::new(config)
            .execute(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_child() {
        let mut config = sh("sleep 10");
        config.exec_timeout = Duration::from_millis(300);
        config.graceful_shutdown = Duration::from_millis(500);

        let start = Instant::now();
        Executable::new(config)
            .execute(&CancellationToken::new())
            .await
            .unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(2500),
            "child outlived its timeout: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_terminate_kills_running_child() {
        let mut config = sh("sleep 10");
        config.graceful_shutdown = Duration::from_millis(500);

        let terminate = CancellationToken::new();
        let cancel = terminate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        Executable::new(config).execute(&terminate).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_exe_name() {
        assert_eq!(exe_name("/usr/bin/server"), "server");
        assert_eq!(exe_name("server"), "server");
    }
}
