use crate::exec::{ExecConfig, Executable, exe_name};
use crate::logging::Logger;
use crate::monitor::{MonitorConfig, ServiceMonitor};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rolling window for the crash counter.
pub const CRASH_WINDOW: Duration = Duration::from_secs(3600);

/// Floor on the restart delay so termination always races an actual sleep,
/// never a tight loop.
const MIN_RESTART_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service exceeded max crash count in the last hour")]
    MaxCrashExceeded,
}

#[derive(Clone)]
pub struct ServiceRunConfig {
    pub path: String,
    pub args: Vec<String>,
    pub startup_delay: Duration,
    pub graceful_shutdown: Duration,
    /// Zero disables the crash budget.
    pub max_crash_count_per_hour: u32,
    pub restart_delay: Duration,
    pub monitor: Option<MonitorConfig>,
    pub logger: Logger,
}

/// Run a service under crash supervision until terminated or the crash
/// budget is exhausted.
///
/// When a monitor is configured, each attempt runs against a derived token
/// that fires on either the outer terminate or the monitor trigger, so a
/// failing liveness probe force-restarts the service; the restart then gets
/// a fresh monitor (and a fresh monitor startup delay).
pub async fn execute_service(
    terminate: &CancellationToken,
    cfg: ServiceRunConfig,
) -> Result<(), ServiceError> {
    let name = exe_name(&cfg.path);

    let done = CancellationToken::new();
    let _done_guard = done.clone().drop_guard();
    {
        let term = terminate.clone();
        let logger = cfg.logger.clone();
        let stop_name = name.clone();
        let done = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = term.cancelled() => logger.log(&format!("{stop_name}: Stopping service...")),
                _ = done.cancelled() => {}
            }
        });
    }

    let restart_delay = cfg.restart_delay.max(MIN_RESTART_DELAY);
    let mut crash_count: u32 = 0;
    let mut window_start = Instant::now();

    loop {
        let run_term = match &cfg.monitor {
            Some(monitor_cfg) if !monitor_cfg.url.is_empty() && !monitor_cfg.interval.is_zero() => {
                cfg.logger.log(&format!(
                    "{name}: Starting service with monitor {}",
                    monitor_cfg.url
                ));
                let monitor = ServiceMonitor {
                    service_name: name.clone(),
                    config: monitor_cfg.clone(),
                    logger: cfg.logger.clone(),
                };
                let trigger = monitor.start(terminate.clone());

                let derived = CancellationToken::new();
                let parent = terminate.clone();
                let fire = derived.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = parent.cancelled() => {}
                        _ = trigger.cancelled() => {}
                    }
                    fire.cancel();
                });
                derived
            }
            _ => terminate.clone(),
        };

        let mut exec_cfg = ExecConfig::new(cfg.path.clone());
        exec_cfg.args = cfg.args.clone();
        exec_cfg.startup_delay = cfg.startup_delay;
        exec_cfg.graceful_shutdown = cfg.graceful_shutdown;
        exec_cfg.logger = Some(cfg.logger.clone());

        cfg.logger.log(&format!("{name}: Starting service..."));
        match Executable::new(exec_cfg).execute(&run_term).await {
            Ok(code) => cfg
                .logger
                .log(&format!("{name}: Service stopped with exit code {code}")),
            Err(e) => cfg
                .logger
                .log(&format!("{name}: Service returned error: {e}")),
        }

        if terminate.is_cancelled() {
            break;
        }

        crash_count += 1;
        if window_start.elapsed() > CRASH_WINDOW {
            window_start = Instant::now();
            crash_count = 0;
        }
        if cfg.max_crash_count_per_hour > 0 && crash_count >= cfg.max_crash_count_per_hour {
            return Err(ServiceError::MaxCrashExceeded);
        }

        tokio::select! {
            _ = terminate.cancelled() => break,
            _ = tokio::time::sleep(restart_delay) => {}
        }
        cfg.logger
            .log(&format!("{name}: Restarting service (crash count: {crash_count})"));
    }

    Ok(())
}
