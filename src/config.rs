use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    pub service_description: ServiceDescription,
    pub service_config: ServiceConfig,
    pub include: Vec<String>,
    pub environment_vars: HashMap<String, String>,
    pub services: Vec<Service>,
    pub startup_tasks: Vec<StartupTask>,
    pub scheduled_tasks: Vec<ScheduledTask>,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceDescription {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceConfig {
    pub stop_file: String,
    pub reload_file: String,
    pub log_file: String,
    pub log_file_max_size_mb: u64,
    pub log_file_max_backup_files: u32,
    pub log_file_timestamp_format: String,
    pub pid_file: String,
    pub user_name: String,
    pub crash_log_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Service {
    pub path: String,
    pub args: Vec<String>,
    pub graceful_shutdown_timeout_secs: u64,
    /// `MaxCrashCount` is the legacy spelling from earlier config revisions.
    #[serde(alias = "MaxCrashCount")]
    pub max_crash_count_per_hour: u32,
    pub restart_delay_secs: u64,
    pub startup_delay_secs: u64,
    pub monitor_ping: Option<MonitorPing>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MonitorPing {
    #[serde(rename = "URL")]
    pub url: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub startup_delay_secs: u64,
    pub restart_on_failure_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StartupTask {
    pub path: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub startup_delay_secs: u64,
    pub startup_random_delay_secs: u64,
    #[serde(rename = "Async")]
    pub run_async: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ScheduledTask {
    pub path: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub startup_delay_secs: u64,
    pub startup_random_delay_secs: u64,
    pub schedule: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Command {
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

/// Sentinel value disabling the stop-file / reload-file contract.
pub const DISABLED: &str = "disabled";

pub const DEFAULT_STOP_FILE: &str = ".stop";
pub const DEFAULT_RELOAD_FILE: &str = ".reload";
pub const DEFAULT_LOG_MAX_SIZE_MB: u64 = 50;
pub const DEFAULT_LOG_MAX_BACKUPS: u32 = 1;
pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The conf file does not exist. Place configuration here: {0}")]
    Missing(PathBuf),
    #[error("{path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("JSON parse error: {0}")]
    Parse(String),
    #[error("ServiceDescription.DisplayName is required configuration")]
    MissingDisplayName,
    #[error("substitution variable {0} was not replaced")]
    UnresolvedVar(String),
    #[error("invalid include pattern '{0}': {1}")]
    BadInclude(String, String),
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ReplacementVars {
    pub service_name: String,
    pub service_root: String,
}

const VAR_SERVICE_NAME: &str = "${ServiceName}";
const VAR_SERVICE_ROOT: &str = "${ServiceRoot}";

/// The config lives next to the executable: `<exe>.conf`, with a Windows
/// `.exe` suffix stripped first.
pub fn config_file_path(exe_path: &Path) -> PathBuf {
    let s = exe_path.to_string_lossy();
    let base = match s.to_lowercase().strip_suffix(".exe") {
        Some(_) => &s[..s.len() - 4],
        None => &s[..],
    };
    PathBuf::from(format!("{base}.conf"))
}

pub fn load_config(path: &Path, vars: &ReplacementVars) -> Result<Config, ConfigError> {
    let mut conf = load(path, Some(vars))?;
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    merge_includes(&mut conf, &base_dir, Some(vars))?;
    validate(&conf)?;
    Ok(conf)
}

/// Parse without `${...}` substitution and without validation. Used by update
/// tooling that inspects configs from outside the service root.
pub fn load_config_no_replacements(path: &Path) -> Result<Config, ConfigError> {
    load(path, None)
}

fn load(path: &Path, vars: Option<&ReplacementVars>) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_config(&text, vars)
}

/// Two-pass parse: the first pass validates the JSON, then `${ServiceName}`
/// and `${ServiceRoot}` are textually substituted (JSON-escaped) and the
/// result is parsed again.
pub fn parse_config(text: &str, vars: Option<&ReplacementVars>) -> Result<Config, ConfigError> {
    let _first: Config =
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let effective = match vars {
        Some(vars) => {
            let replaced = text
                .replace(VAR_SERVICE_NAME, &json_escape(&vars.service_name))
                .replace(VAR_SERVICE_ROOT, &json_escape(&vars.service_root));
            for token in [VAR_SERVICE_NAME, VAR_SERVICE_ROOT] {
                if replaced.contains(token) {
                    return Err(ConfigError::UnresolvedVar(token.to_string()));
                }
            }
            replaced
        }
        None => text.to_string(),
    };

    let mut conf: Config =
        serde_json::from_str(&effective).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_defaults(&mut conf);
    Ok(conf)
}

fn merge_includes(
    conf: &mut Config,
    base_dir: &Path,
    vars: Option<&ReplacementVars>,
) -> Result<(), ConfigError> {
    let patterns = std::mem::take(&mut conf.include);
    for pattern in &patterns {
        let absolute = if Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            base_dir.join(pattern).to_string_lossy().into_owned()
        };
        let paths = glob::glob(&absolute)
            .map_err(|e| ConfigError::BadInclude(pattern.clone(), e.to_string()))?;

        let mut matches: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
        matches.sort();

        for file in matches {
            let include = load(&file, vars)?;
            conf.services.extend(include.services);
            conf.startup_tasks.extend(include.startup_tasks);
            conf.scheduled_tasks.extend(include.scheduled_tasks);
            conf.commands.extend(include.commands);
            // Later includes win on key collisions.
            conf.environment_vars.extend(include.environment_vars);
        }
    }
    conf.include = patterns;
    Ok(())
}

fn validate(conf: &Config) -> Result<(), ConfigError> {
    if conf.service_description.display_name.is_empty() {
        return Err(ConfigError::MissingDisplayName);
    }
    Ok(())
}

fn apply_defaults(conf: &mut Config) {
    let sc = &mut conf.service_config;
    if sc.stop_file.is_empty() {
        sc.stop_file = DEFAULT_STOP_FILE.to_string();
    }
    if sc.reload_file.is_empty() {
        sc.reload_file = DEFAULT_RELOAD_FILE.to_string();
    }
    if sc.log_file_max_size_mb == 0 {
        sc.log_file_max_size_mb = DEFAULT_LOG_MAX_SIZE_MB;
    }
    if sc.log_file_max_backup_files == 0 {
        sc.log_file_max_backup_files = DEFAULT_LOG_MAX_BACKUPS;
    }

    for service in &mut conf.services {
        if service.graceful_shutdown_timeout_secs == 0 {
            service.graceful_shutdown_timeout_secs = DEFAULT_GRACEFUL_SHUTDOWN_SECS;
        }
    }
}

fn json_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> ReplacementVars {
        ReplacementVars {
            service_name: "testsvc".to_string(),
            service_root: "/opt/testsvc".to_string(),
        }
    }

    #[test]
    fn test_full_config_parses() {
        let input = r#"{
            "ServiceDescription": {
                "Name": "demo",
                "DisplayName": "Demo Service",
                "Description": "A demo"
            },
            "ServiceConfig": {
                "StopFile": ".halt",
                "ReloadFile": ".refresh",
                "LogFile": "demo.log",
                "LogFileMaxSizeMb": 10,
                "LogFileMaxBackupFiles": 3,
                "LogFileTimestampFormat": "[%H:%M] ",
                "PidFile": "demo.pid",
                "UserName": "svcuser",
                "CrashLogFile": "crash.log"
            },
            "EnvironmentVars": { "APP_MODE": "production" },
            "Services": [
                {
                    "Path": "bin/server",
                    "Args": ["--port", "8080"],
                    "GracefulShutdownTimeoutSecs": 10,
                    "MaxCrashCountPerHour": 5,
                    "RestartDelaySecs": 2,
                    "StartupDelaySecs": 1,
                    "MonitorPing": {
                        "URL": "tcp://127.0.0.1:8080",
                        "IntervalSecs": 30,
                        "TimeoutSecs": 5,
                        "StartupDelaySecs": 60,
                        "RestartOnFailureCount": 3
                    }
                }
            ],
            "StartupTasks": [
                {
                    "Path": "bin/migrate",
                    "Args": ["--up"],
                    "TimeoutSecs": 120,
                    "StartupDelaySecs": 5,
                    "StartupRandomDelaySecs": 10,
                    "Async": true
                }
            ],
            "ScheduledTasks": [
                {
                    "Path": "bin/cleanup",
                    "Schedule": "0 0 3 * * *",
                    "TimeoutSecs": 600
                }
            ],
            "Commands": [
                { "Name": "status", "Path": "bin/status", "Args": ["-v"], "TimeoutSecs": 30 }
            ]
        }"#;

        let conf = parse_config(input, Some(&vars())).unwrap();
        assert_eq!(conf.service_description.display_name, "Demo Service");
        assert_eq!(conf.service_config.stop_file, ".halt");
        assert_eq!(conf.service_config.log_file_max_backup_files, 3);
        assert_eq!(conf.service_config.user_name, "svcuser");
        assert_eq!(conf.environment_vars["APP_MODE"], "production");

        let svc = &conf.services[0];
        assert_eq!(svc.path, "bin/server");
        assert_eq!(svc.args, vec!["--port", "8080"]);
        assert_eq!(svc.max_crash_count_per_hour, 5);
        let ping = svc.monitor_ping.as_ref().unwrap();
        assert_eq!(ping.url, "tcp://127.0.0.1:8080");
        assert_eq!(ping.restart_on_failure_count, 3);

        assert!(conf.startup_tasks[0].run_async);
        assert_eq!(conf.scheduled_tasks[0].schedule, "0 0 3 * * *");
        assert_eq!(conf.commands[0].name, "status");
    }

    #[test]
    fn test_defaults_applied() {
        let input = r#"{
            "ServiceDescription": { "DisplayName": "Demo" },
            "Services": [ { "Path": "bin/server" } ]
        }"#;
        let conf = parse_config(input, Some(&vars())).unwrap();
        assert_eq!(conf.service_config.stop_file, ".stop");
        assert_eq!(conf.service_config.reload_file, ".reload");
        assert_eq!(conf.service_config.log_file_max_size_mb, 50);
        assert_eq!(conf.service_config.log_file_max_backup_files, 1);
        assert_eq!(conf.services[0].graceful_shutdown_timeout_secs, 5);
        assert!(conf.environment_vars.is_empty());
    }

    #[test]
    fn test_display_name_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.conf");
        std::fs::write(&path, r#"{ "Services": [] }"#).unwrap();
        let result = load_config(&path, &vars());
        assert!(matches!(result, Err(ConfigError::MissingDisplayName)));
    }

    #[test]
    fn test_substitution() {
        let input = r#"{
            "ServiceDescription": { "DisplayName": "${ServiceName}" },
            "Services": [ { "Path": "${ServiceRoot}/bin/server" } ]
        }"#;
        let conf = parse_config(input, Some(&vars())).unwrap();
        assert_eq!(conf.service_description.display_name, "testsvc");
        assert_eq!(conf.services[0].path, "/opt/testsvc/bin/server");
    }

    #[test]
    fn test_substitution_json_escapes() {
        let input = r#"{
            "ServiceDescription": { "DisplayName": "x" },
            "Services": [ { "Path": "${ServiceRoot}\\bin\\server.exe" } ]
        }"#;
        let windows_vars = ReplacementVars {
            service_name: "svc".to_string(),
            service_root: r"C:\Program Files\svc".to_string(),
        };
        let conf = parse_config(input, Some(&windows_vars)).unwrap();
        assert_eq!(conf.services[0].path, r"C:\Program Files\svc\bin\server.exe");
    }

    #[test]
    fn test_no_replacement_mode_keeps_tokens() {
        let input = r#"{
            "ServiceDescription": { "DisplayName": "x" },
            "Services": [ { "Path": "${ServiceRoot}/bin/server" } ]
        }"#;
        let conf = parse_config(input, None).unwrap();
        assert_eq!(conf.services[0].path, "${ServiceRoot}/bin/server");
    }

    #[test]
    fn test_max_crash_count_legacy_alias() {
        let input = r#"{
            "ServiceDescription": { "DisplayName": "x" },
            "Services": [ { "Path": "bin/server", "MaxCrashCount": 7 } ]
        }"#;
        let conf = parse_config(input, Some(&vars())).unwrap();
        assert_eq!(conf.services[0].max_crash_count_per_hour, 7);
    }

    #[test]
    fn test_invalid_json_errors() {
        let result = parse_config("{ not json", Some(&vars()));
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_message() {
        let err = load_config(Path::new("/no/such/dir/app.conf"), &vars()).unwrap_err();
        assert!(err.to_string().contains("Place configuration here"));
    }

    #[test]
    fn test_includes_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("svc.conf");
        std::fs::write(
            dir.path().join("10-web.conf"),
            r#"{ "Services": [ { "Path": "bin/web" } ],
                 "EnvironmentVars": { "SHARED": "web", "WEB": "1" } }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-worker.conf"),
            r#"{ "Services": [ { "Path": "bin/worker" } ],
                 "StartupTasks": [ { "Path": "bin/prep" } ],
                 "EnvironmentVars": { "SHARED": "worker" } }"#,
        )
        .unwrap();
        std::fs::write(
            &main_path,
            r#"{
                "ServiceDescription": { "DisplayName": "Demo" },
                "Include": [ "*-web.conf", "*-worker.conf" ],
                "EnvironmentVars": { "SHARED": "main" }
            }"#,
        )
        .unwrap();

        let conf = load_config(&main_path, &vars()).unwrap();
        assert_eq!(conf.services.len(), 2);
        assert_eq!(conf.services[0].path, "bin/web");
        assert_eq!(conf.services[1].path, "bin/worker");
        assert_eq!(conf.startup_tasks.len(), 1);
        // Later include wins on collision.
        assert_eq!(conf.environment_vars["SHARED"], "worker");
        assert_eq!(conf.environment_vars["WEB"], "1");
    }

    #[test]
    fn test_include_defaults_apply_to_included_services() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("svc.conf");
        std::fs::write(
            dir.path().join("extra.conf"),
            r#"{ "Services": [ { "Path": "bin/extra" } ] }"#,
        )
        .unwrap();
        std::fs::write(
            &main_path,
            r#"{ "ServiceDescription": { "DisplayName": "Demo" }, "Include": [ "extra.conf" ] }"#,
        )
        .unwrap();

        let conf = load_config(&main_path, &vars()).unwrap();
        assert_eq!(conf.services[0].graceful_shutdown_timeout_secs, 5);
    }

    #[test]
    fn test_include_without_matches_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("svc.conf");
        std::fs::write(
            &main_path,
            r#"{ "ServiceDescription": { "DisplayName": "Demo" }, "Include": [ "missing-*.conf" ] }"#,
        )
        .unwrap();

        let conf = load_config(&main_path, &vars()).unwrap();
        assert!(conf.services.is_empty());
    }

    #[test]
    fn test_config_file_path_plain() {
        assert_eq!(
            config_file_path(Path::new("/opt/svc/silver")),
            PathBuf::from("/opt/svc/silver.conf")
        );
    }

    #[test]
    fn test_config_file_path_strips_exe() {
        assert_eq!(
            config_file_path(Path::new(r"C:\svc\silver.exe")),
            PathBuf::from(r"C:\svc\silver.conf")
        );
        assert_eq!(
            config_file_path(Path::new(r"C:\svc\SILVER.EXE")),
            PathBuf::from(r"C:\svc\SILVER.conf")
        );
    }

    #[test]
    fn test_disabled_sentinel_round_trips() {
        let input = r#"{
            "ServiceDescription": { "DisplayName": "x" },
            "ServiceConfig": { "StopFile": "disabled", "ReloadFile": "disabled" }
        }"#;
        let conf = parse_config(input, Some(&vars())).unwrap();
        assert_eq!(conf.service_config.stop_file, DISABLED);
        assert_eq!(conf.service_config.reload_file, DISABLED);
    }
}
