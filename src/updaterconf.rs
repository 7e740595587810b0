//! Enable/disable auto updates for an installed service by editing its
//! config. Embedding applications call this from outside the supervisor:
//! disabling strips the updater's startup/scheduled tasks (after backing the
//! config up), enabling restores the backup, and either way the service is
//! asked to reload.

use crate::config;
use crate::update::{RELOAD_FILE, VERSION_FILE};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;

const STARTUP_TASKS_KEY: &str = "StartupTasks";
const SCHEDULED_TASKS_KEY: &str = "ScheduledTasks";
const PATH_KEY: &str = "Path";

const DEFAULT_UPDATER_FILENAME: &str = "silver-updater";
const DEFAULT_BACKUP_PREFIX: &str = "backup-";

#[derive(Debug, thiserror::Error)]
pub enum UpdaterConfError {
    #[error("missing service location arguments")]
    MissingArguments,
    #[error("app is already reloading, cannot change auto updates until reloading completes")]
    Reloading,
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid config JSON: {0}")]
    Json(String),
}

/// Handle on a service installation's update configuration.
pub struct UpdaterConf {
    service_dir: PathBuf,
    config_filename: String,
    updater_filename: String,
    version_filename: String,
    backup_prefix: String,
    lock: Mutex<()>,
}

impl UpdaterConf {
    /// Open the installation at `service_dir`. Any stale reload request is
    /// discarded and a pristine config backup is captured if one does not
    /// exist yet.
    pub fn create(
        service_dir: impl Into<PathBuf>,
        config_filename: &str,
        updater_filename: &str,
    ) -> Result<UpdaterConf, UpdaterConfError> {
        let service_dir = service_dir.into();
        if service_dir.as_os_str().is_empty() || config_filename.is_empty() {
            return Err(UpdaterConfError::MissingArguments);
        }
        let updater_filename = if updater_filename.is_empty() {
            DEFAULT_UPDATER_FILENAME
        } else {
            updater_filename
        };

        let conf = UpdaterConf {
            service_dir,
            config_filename: config_filename.to_string(),
            updater_filename: updater_filename.to_string(),
            version_filename: VERSION_FILE.to_string(),
            backup_prefix: DEFAULT_BACKUP_PREFIX.to_string(),
            lock: Mutex::new(()),
        };

        conf.delete_reload_file()?;
        conf.backup_config_if_required()?;
        Ok(conf)
    }

    pub fn with_backup_prefix(mut self, prefix: &str) -> Self {
        self.backup_prefix = prefix.to_string();
        self
    }

    pub fn with_version_filename(mut self, filename: &str) -> Self {
        self.version_filename = filename.to_string();
        self
    }

    fn file_path(&self, filename: &str) -> PathBuf {
        self.service_dir.join(filename)
    }

    fn config_path(&self) -> PathBuf {
        self.file_path(&self.config_filename)
    }

    fn backup_config_path(&self) -> PathBuf {
        self.file_path(&format!("{}{}", self.backup_prefix, self.config_filename))
    }

    fn reload_path(&self) -> PathBuf {
        self.file_path(RELOAD_FILE)
    }

    /// Current update version from the version file, empty when absent.
    pub fn current_version(&self) -> String {
        std::fs::read_to_string(self.file_path(&self.version_filename))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    /// Whether a service reload is pending.
    pub fn is_reloading(&self) -> bool {
        self.reload_path().exists()
    }

    /// Whether the active config still carries any updater task.
    pub fn is_auto_update_enabled(&self) -> Result<bool, UpdaterConfError> {
        let conf = config::load_config_no_replacements(&self.config_path())?;
        let has_updater_task = conf
            .startup_tasks
            .iter()
            .map(|t| t.path.as_str())
            .chain(conf.scheduled_tasks.iter().map(|t| t.path.as_str()))
            .any(|path| path.contains(&self.updater_filename));
        Ok(has_updater_task)
    }

    /// Restore the backed-up config (which carries the updater tasks) and
    /// request a reload.
    pub fn enable_auto_updates(&self) -> Result<(), UpdaterConfError> {
        let _guard = self.lock.lock();

        if self.is_reloading() {
            return Err(UpdaterConfError::Reloading);
        }
        if self.is_auto_update_enabled()? {
            return Ok(());
        }

        std::fs::copy(self.backup_config_path(), self.config_path())
            .map_err(|e| UpdaterConfError::Io(e.to_string()))?;
        self.request_reload()
    }

    /// Strip updater tasks from the active config (backing it up first) and
    /// request a reload.
    pub fn disable_auto_updates(&self) -> Result<(), UpdaterConfError> {
        let _guard = self.lock.lock();

        if self.is_reloading() {
            return Err(UpdaterConfError::Reloading);
        }
        if !self.is_auto_update_enabled()? {
            return Ok(());
        }

        self.backup_config_if_required()?;

        // Work on the raw JSON document so unknown keys and unexpanded
        // substitution tokens survive the rewrite.
        let raw = std::fs::read(self.config_path())
            .map_err(|e| UpdaterConfError::Io(e.to_string()))?;
        let mut doc: Value =
            serde_json::from_slice(&raw).map_err(|e| UpdaterConfError::Json(e.to_string()))?;

        if let Value::Object(map) = &mut doc {
            for key in [STARTUP_TASKS_KEY, SCHEDULED_TASKS_KEY] {
                let Some(Value::Array(tasks)) = map.get_mut(key) else {
                    continue;
                };
                tasks.retain(|task| !self.is_updater_task(task));
                if tasks.is_empty() {
                    map.remove(key);
                }
            }
        }

        let pretty = serde_json::to_vec_pretty(&doc)
            .map_err(|e| UpdaterConfError::Json(e.to_string()))?;
        std::fs::write(self.config_path(), pretty)
            .map_err(|e| UpdaterConfError::Io(e.to_string()))?;

        self.request_reload()
    }

    fn is_updater_task(&self, task: &Value) -> bool {
        task.get(PATH_KEY)
            .and_then(Value::as_str)
            .is_some_and(|path| path.contains(&self.updater_filename))
    }

    fn request_reload(&self) -> Result<(), UpdaterConfError> {
        std::fs::write(self.reload_path(), "").map_err(|e| UpdaterConfError::Io(e.to_string()))
    }

    fn delete_reload_file(&self) -> Result<(), UpdaterConfError> {
        let path = self.reload_path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| UpdaterConfError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn backup_config_if_required(&self) -> Result<(), UpdaterConfError> {
        let backup = self.backup_config_path();
        if backup.exists() {
            return Ok(());
        }
        std::fs::copy(self.config_path(), &backup)
            .map_err(|e| UpdaterConfError::Io(e.to_string()))?;
        Ok(())
    }
}
