use crate::exec::{ExecConfig, ExecError, Executable, exe_name};
use crate::logging::Logger;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct TaskRunConfig {
    pub path: String,
    pub args: Vec<String>,
    pub startup_delay: Duration,
    /// Upper bound of the uniformly sampled additive jitter.
    pub startup_random_delay: Duration,
    /// Zero disables the timeout.
    pub exec_timeout: Duration,
    pub graceful_shutdown: Duration,
    pub logger: Logger,
}

/// Run a one-shot task: jittered startup delay, then execution under a hard
/// timeout. Returns the child's exit code.
pub async fn execute_task(
    terminate: &CancellationToken,
    cfg: TaskRunConfig,
) -> Result<i32, ExecError> {
    let name = exe_name(&cfg.path);

    let mut startup_delay = cfg.startup_delay;
    if cfg.startup_random_delay > Duration::ZERO {
        let max_ms = cfg.startup_random_delay.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
        startup_delay += Duration::from_millis(jitter_ms);
    }

    let done = CancellationToken::new();
    let _done_guard = done.clone().drop_guard();
    {
        let term = terminate.clone();
        let logger = cfg.logger.clone();
        let stop_name = name.clone();
        let done = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = term.cancelled() => logger.log(&format!("{stop_name}: Stopping task...")),
                _ = done.cancelled() => {}
            }
        });
    }

    let mut exec_cfg = ExecConfig::new(cfg.path.clone());
    exec_cfg.args = cfg.args.clone();
    exec_cfg.startup_delay = startup_delay;
    exec_cfg.exec_timeout = cfg.exec_timeout;
    exec_cfg.graceful_shutdown = cfg.graceful_shutdown;
    exec_cfg.logger = Some(cfg.logger.clone());

    cfg.logger.log(&format!("{name}: Starting task..."));
    Executable::new(exec_cfg).execute(terminate).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_task(script: &str) -> TaskRunConfig {
        TaskRunConfig {
            path: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            startup_delay: Duration::ZERO,
            startup_random_delay: Duration::ZERO,
            exec_timeout: Duration::ZERO,
            graceful_shutdown: Duration::from_millis(500),
            logger: Logger::null(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_returned() {
        let code = execute_task(&CancellationToken::new(), sh_task("exit 7"))
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let mut cfg = sh_task("sleep 10");
        cfg.exec_timeout = Duration::from_millis(300);
        cfg.graceful_shutdown = Duration::from_millis(300);

        let start = Instant::now();
        execute_task(&CancellationToken::new(), cfg).await.unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(2500),
            "task outlived its timeout: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_jitter_stays_within_bounds() {
        let mut cfg = sh_task("exit 0");
        cfg.startup_delay = Duration::from_millis(100);
        cfg.startup_random_delay = Duration::from_millis(200);

        let start = Instant::now();
        execute_task(&CancellationToken::new(), cfg).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "got {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "got {elapsed:?}");
    }

    #[tokio::test]
    async fn test_terminate_during_delay_cancels_task() {
        let mut cfg = sh_task("exit 0");
        cfg.startup_delay = Duration::from_secs(30);

        let terminate = CancellationToken::new();
        let cancel = terminate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = execute_task(&terminate, cfg).await;
        assert!(matches!(result, Err(ExecError::ManuallyTerminated)));
    }

    #[tokio::test]
    async fn test_timeout_budget_includes_startup_delay() {
        // With a startup delay in play the child must still get its full
        // execution window before the timeout fires.
        let mut cfg = sh_task("exit 5");
        cfg.startup_delay = Duration::from_millis(300);
        cfg.exec_timeout = Duration::from_millis(400);

        let code = execute_task(&CancellationToken::new(), cfg).await.unwrap();
        assert_eq!(code, 5, "child should have run to completion");
    }
}
