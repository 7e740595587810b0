use crate::config::{self, Config, ConfigError, DISABLED, ReplacementVars};
use crate::logging::Logger;
use crate::monitor::MonitorConfig;
use crate::pathutil::find_last_file;
use crate::proxy;
use crate::sched::{self, Scheduler};
use crate::service::{ServiceRunConfig, execute_service};
use crate::task::{TaskRunConfig, execute_task};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The reload file is polled, not watched: polling behaves identically on
/// every platform and filesystem.
pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Quiesce between a reload's stop and the next generation's start.
pub const RELOAD_QUIESCE: Duration = Duration::from_secs(1);

pub const ENV_SERVICE_NAME: &str = "SILVER_SERVICE_NAME";
pub const ENV_SERVICE_ROOT: &str = "SILVER_SERVICE_ROOT";
pub const ENV_SERVICE_PID: &str = "SILVER_SERVICE_PID";

// ---------------------------------------------------------------------------
// Executable identity helpers
// ---------------------------------------------------------------------------

/// The service takes its name from the executable, minus a Windows `.exe`.
pub fn service_name_from_exe(exe: &Path) -> String {
    let name = exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.to_lowercase().strip_suffix(".exe") {
        Some(_) => name[..name.len() - 4].to_string(),
        None => name,
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Top-level lifecycle owner. Each generation is one coherent
/// `(config, terminate, tracker, scheduler)` tuple; `stop` drains the whole
/// generation and `reload` swaps in the next one.
pub struct Supervisor {
    root: PathBuf,
    config_path: Option<PathBuf>,
    vars: ReplacementVars,
    config: Config,
    logger: Logger,
    terminate: CancellationToken,
    tracker: TaskTracker,
    scheduler: Option<Scheduler>,
}

impl Supervisor {
    /// Load the config from disk and build a supervisor rooted at the
    /// executable's folder, logging to the configured rotating file.
    pub fn new(
        root: PathBuf,
        config_path: PathBuf,
        service_name: &str,
    ) -> Result<Self, ConfigError> {
        let vars = ReplacementVars {
            service_name: service_name.to_string(),
            service_root: root.to_string_lossy().into_owned(),
        };
        let config = config::load_config(&config_path, &vars)?;

        let log_file = if config.service_config.log_file.is_empty() {
            format!("{service_name}.log")
        } else {
            config.service_config.log_file.clone()
        };
        let timestamp_format = if config.service_config.log_file_timestamp_format.is_empty() {
            None
        } else {
            Some(config.service_config.log_file_timestamp_format.clone())
        };
        let logger = Logger::rolling(
            root.join(log_file),
            config.service_config.log_file_max_size_mb * 1024 * 1024,
            config.service_config.log_file_max_backup_files,
            timestamp_format,
        );

        Ok(Self {
            root,
            config_path: Some(config_path),
            vars,
            config,
            logger,
            terminate: CancellationToken::new(),
            tracker: TaskTracker::new(),
            scheduler: None,
        })
    }

    /// Build a supervisor around an already-loaded config. Reload keeps the
    /// current config when no path is attached.
    pub fn with_config(root: PathBuf, config: Config, logger: Logger) -> Self {
        let vars = ReplacementVars {
            service_name: config.service_description.name.clone(),
            service_root: root.to_string_lossy().into_owned(),
        };
        Self {
            root,
            config_path: None,
            vars,
            config,
            logger,
            terminate: CancellationToken::new(),
            tracker: TaskTracker::new(),
            scheduler: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> Logger {
        self.logger.clone()
    }

    /// Bring up one generation: environment, pid file, startup tasks (sync
    /// ones block this call), scheduler, services.
    pub async fn start(&mut self) {
        self.terminate = CancellationToken::new();
        self.tracker = TaskTracker::new();

        self.export_environment();
        self.write_pid_file();

        self.run_startup_tasks().await;
        self.start_scheduler();
        self.start_services();
    }

    /// Drain the current generation: stop file out, scheduler halted,
    /// terminate fired, every tracked task awaited.
    pub async fn stop(&mut self) {
        let stop_file = self.config.service_config.stop_file.clone();
        let stop_path = (stop_file != DISABLED).then(|| self.root.join(&stop_file));
        if let Some(path) = &stop_path {
            let _ = std::fs::write(path, "");
        }

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }

        self.terminate.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        if let Some(path) = &stop_path {
            let _ = std::fs::remove_file(path);
        }
        self.remove_pid_file();
    }

    /// stop, quiesce, re-read the config (keeping the previous generation's
    /// config when the new one fails to parse), start again.
    pub async fn reload(&mut self) {
        self.stop().await;
        tokio::time::sleep(RELOAD_QUIESCE).await;

        if let Some(path) = self.config_path.clone() {
            match config::load_config(&path, &self.vars) {
                Ok(new_config) => self.config = new_config,
                Err(e) => self.logger.log(&format!(
                    "ERROR: Reload failed, keeping previous configuration: {e}"
                )),
            }
        }

        self.start().await;
    }

    /// Foreground mode: start, then watch for reload requests until a
    /// shutdown signal arrives.
    pub async fn run(&mut self) {
        self.logger
            .log(&format!("Service '{}' started.", self.vars.service_name));
        self.start().await;

        loop {
            tokio::select! {
                _ = shutdown_signal() => break,
                _ = tokio::time::sleep(RELOAD_POLL_INTERVAL) => {
                    if self.consume_reload_request() {
                        self.logger.log("Reload requested");
                        self.reload().await;
                    }
                }
            }
        }

        self.logger
            .log(&format!("Stopping '{}' service...", self.vars.service_name));
        self.stop().await;
        self.logger
            .log(&format!("Stopped '{}' service.", self.vars.service_name));
        self.logger.close();
    }

    /// True when a reload file existed and we won the race to remove it.
    pub fn consume_reload_request(&self) -> bool {
        let reload_file = &self.config.service_config.reload_file;
        if reload_file.as_str() == DISABLED {
            return false;
        }
        let path = self.root.join(reload_file);
        path.exists() && std::fs::remove_file(&path).is_ok()
    }

    // -- generation pieces --------------------------------------------------

    fn export_environment(&self) {
        let mut exports: Vec<(String, String)> = self
            .config
            .environment_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        exports.push((ENV_SERVICE_NAME.to_string(), self.vars.service_name.clone()));
        exports.push((ENV_SERVICE_ROOT.to_string(), self.vars.service_root.clone()));
        exports.push((ENV_SERVICE_PID.to_string(), std::process::id().to_string()));
        if let Some(proxy_url) = proxy::read_proxy_conf(&self.root) {
            exports.push((proxy::SILVER_HTTP_PROXY_ENV.to_string(), proxy_url));
        }

        for (key, value) in exports {
            // Exported before any worker task of this generation spawns;
            // children inherit the supervisor environment.
            unsafe { std::env::set_var(key, value) };
        }
    }

    fn write_pid_file(&self) {
        let pid_file = &self.config.service_config.pid_file;
        if !pid_file.is_empty() {
            let _ = std::fs::write(
                self.root.join(pid_file),
                format!("{}\n", std::process::id()),
            );
        }
    }

    fn remove_pid_file(&self) {
        let pid_file = &self.config.service_config.pid_file;
        if !pid_file.is_empty() {
            let _ = std::fs::remove_file(self.root.join(pid_file));
        }
    }

    async fn run_startup_tasks(&self) {
        for task in &self.config.startup_tasks {
            let mut cfg = TaskRunConfig {
                path: find_last_file(&task.path),
                args: task.args.clone(),
                startup_delay: Duration::from_secs(task.startup_delay_secs),
                startup_random_delay: Duration::from_secs(task.startup_random_delay_secs),
                exec_timeout: Duration::from_secs(task.timeout_secs),
                graceful_shutdown: crate::exec::DEFAULT_GRACEFUL_SHUTDOWN,
                logger: self.logger.clone(),
            };

            if task.run_async {
                let terminate = self.terminate.clone();
                let logger = self.logger.clone();
                let path = cfg.path.clone();
                self.tracker.spawn(async move {
                    if let Err(e) = execute_task(&terminate, cfg).await {
                        logger.log(&format!("ERROR: Startup task '{path}' reported: {e}"));
                    }
                });
            } else {
                if task.startup_delay_secs > 0 || task.startup_random_delay_secs > 0 {
                    self.logger
                        .log("WARNING: Only Async startup tasks may have startup delays.");
                    cfg.startup_delay = Duration::ZERO;
                    cfg.startup_random_delay = Duration::ZERO;
                }
                if let Err(e) = execute_task(&self.terminate, cfg).await {
                    self.logger
                        .log(&format!("ERROR: Startup task '{}' reported: {e}", task.path));
                }
            }
        }
    }

    fn start_scheduler(&mut self) {
        let mut scheduler = Scheduler::new();
        for task in &self.config.scheduled_tasks {
            let schedule = match sched::parse_cron_expression(&task.schedule) {
                Ok(s) => s,
                Err(e) => {
                    self.logger
                        .log(&format!("Unable to schedule task '{}': {e}", task.path));
                    continue;
                }
            };

            let cfg = TaskRunConfig {
                path: find_last_file(&task.path),
                args: task.args.clone(),
                startup_delay: Duration::from_secs(task.startup_delay_secs),
                startup_random_delay: Duration::from_secs(task.startup_random_delay_secs),
                exec_timeout: Duration::from_secs(task.timeout_secs),
                graceful_shutdown: crate::exec::DEFAULT_GRACEFUL_SHUTDOWN,
                logger: self.logger.clone(),
            };
            let tracker = self.tracker.clone();
            let terminate = self.terminate.clone();
            let logger = self.logger.clone();

            scheduler.add_task(schedule, move || {
                let cfg = cfg.clone();
                let terminate = terminate.clone();
                let logger = logger.clone();
                let path = cfg.path.clone();
                tracker.spawn(async move {
                    if let Err(e) = execute_task(&terminate, cfg).await {
                        logger.log(&format!("Error raised by scheduled task '{path}': {e}"));
                    }
                });
            });
        }
        scheduler.start();
        self.scheduler = Some(scheduler);
    }

    fn start_services(&self) {
        for service in &self.config.services {
            let cfg = ServiceRunConfig {
                path: find_last_file(&service.path),
                args: service.args.clone(),
                startup_delay: Duration::from_secs(service.startup_delay_secs),
                graceful_shutdown: Duration::from_secs(service.graceful_shutdown_timeout_secs),
                max_crash_count_per_hour: service.max_crash_count_per_hour,
                restart_delay: Duration::from_secs(service.restart_delay_secs),
                monitor: service.monitor_ping.as_ref().map(MonitorConfig::from),
                logger: self.logger.clone(),
            };
            let terminate = self.terminate.clone();
            let logger = self.logger.clone();
            let path = cfg.path.clone();
            self.tracker.spawn(async move {
                if let Err(e) = execute_service(&terminate, cfg).await {
                    logger.log(&format!("ERROR: Service '{path}' reported: {e}"));
                }
            });
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).unwrap();
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
