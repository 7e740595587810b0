use silver::config::{Config, ReplacementVars, parse_config};
use silver::logging::Logger;
use silver::supervisor::Supervisor;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config_for(root: &Path, json: &str) -> Config {
    let vars = ReplacementVars {
        service_name: "testsvc".to_string(),
        service_root: root.to_string_lossy().into_owned(),
    };
    parse_config(json, Some(&vars)).unwrap()
}

fn supervisor_for(root: &Path, json: &str) -> Supervisor {
    Supervisor::with_config(root.to_path_buf(), config_for(root, json), Logger::null())
}

async fn wait_for(path: &Path, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    path.exists()
}

#[tokio::test]
async fn test_sync_startup_task_completes_before_start_returns() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("task-ran");

    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "StartupTasks": [
                {{ "Path": "sh", "Args": ["-c", "touch {marker}"] }}
            ]
        }}"#,
        marker = marker.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    supervisor.start().await;
    assert!(marker.exists(), "sync startup task must block start");
    supervisor.stop().await;
}

#[tokio::test]
async fn test_async_startup_task_does_not_block_start() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("async-ran");

    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "StartupTasks": [
                {{ "Path": "sh", "Args": ["-c", "touch {marker}"],
                   "StartupDelaySecs": 1, "Async": true }}
            ]
        }}"#,
        marker = marker.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    let start = Instant::now();
    supervisor.start().await;
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "async task delay must not block start"
    );
    assert!(!marker.exists(), "delayed task must not have run yet");

    assert!(wait_for(&marker, Duration::from_secs(3)).await);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_non_async_startup_delay_warns_and_is_ignored() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("sync-ran");
    let (logger, lines) = Logger::memory();

    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "StartupTasks": [
                {{ "Path": "sh", "Args": ["-c", "touch {marker}"], "StartupDelaySecs": 30 }}
            ]
        }}"#,
        marker = marker.display()
    );
    let mut supervisor =
        Supervisor::with_config(dir.path().to_path_buf(), config_for(dir.path(), &json), logger);

    let start = Instant::now();
    supervisor.start().await;
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "declared delay must be ignored for sync tasks"
    );
    assert!(marker.exists());
    assert!(
        lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.contains("Only Async startup tasks may have startup delays")),
        "expected a warning about sync-task delays"
    );
    supervisor.stop().await;
}

#[tokio::test]
async fn test_service_startup_delay_respected() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("svc-ran");

    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "Services": [
                {{ "Path": "sh", "Args": ["-c", "touch {marker}; sleep 30"],
                   "StartupDelaySecs": 1, "MaxCrashCountPerHour": 1 }}
            ]
        }}"#,
        marker = marker.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!marker.exists(), "service must not spawn before its delay");

    assert!(wait_for(&marker, Duration::from_secs(3)).await);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_stop_file_signals_children_and_is_removed() {
    let dir = TempDir::new().unwrap();
    let stop_path = dir.path().join(".stop");

    // The child polls the stop file as its cooperative shutdown hint.
    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "Services": [
                {{ "Path": "sh",
                   "Args": ["-c", "while [ ! -f {stop} ]; do sleep 0.1; done"],
                   "GracefulShutdownTimeoutSecs": 10 }}
            ]
        }}"#,
        stop = stop_path.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let start = Instant::now();
    supervisor.stop().await;
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "child should have seen the stop file and exited"
    );
    assert!(!stop_path.exists(), "stop file is removed after draining");
}

#[tokio::test]
async fn test_pid_file_lifecycle() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("svc.pid");

    let json = r#"{
        "ServiceDescription": { "DisplayName": "Demo" },
        "ServiceConfig": { "PidFile": "svc.pid" }
    }"#;
    let mut supervisor = supervisor_for(dir.path(), json);

    supervisor.start().await;
    let contents = std::fs::read_to_string(&pid_path).unwrap();
    assert_eq!(contents, format!("{}\n", std::process::id()));

    supervisor.stop().await;
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_scheduled_task_fires() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("fires");

    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "ScheduledTasks": [
                {{ "Path": "sh", "Args": ["-c", "echo x >> {counter}"],
                   "Schedule": "* * * * * *" }}
            ]
        }}"#,
        counter = counter.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(2300)).await;
    supervisor.stop().await;

    let fired = std::fs::read_to_string(&counter).unwrap_or_default().lines().count();
    assert!((1..=3).contains(&fired), "scheduled task fired {fired} times");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let after_stop = std::fs::read_to_string(&counter).unwrap_or_default().lines().count();
    assert_eq!(fired, after_stop, "no fires after stop");
}

#[tokio::test]
async fn test_consume_reload_request() {
    let dir = TempDir::new().unwrap();
    let json = r#"{ "ServiceDescription": { "DisplayName": "Demo" } }"#;
    let supervisor = supervisor_for(dir.path(), json);

    // No reload file: nothing to consume (reload is idempotent).
    assert!(!supervisor.consume_reload_request());

    std::fs::write(dir.path().join(".reload"), "").unwrap();
    assert!(supervisor.consume_reload_request());
    assert!(!dir.path().join(".reload").exists());
    assert!(!supervisor.consume_reload_request());
}

#[tokio::test]
async fn test_disabled_reload_file_never_consumed() {
    let dir = TempDir::new().unwrap();
    let json = r#"{
        "ServiceDescription": { "DisplayName": "Demo" },
        "ServiceConfig": { "ReloadFile": "disabled" }
    }"#;
    let supervisor = supervisor_for(dir.path(), json);

    std::fs::write(dir.path().join("disabled"), "").unwrap();
    assert!(!supervisor.consume_reload_request());
    assert!(dir.path().join("disabled").exists());
}

#[tokio::test]
async fn test_reload_picks_up_new_config() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("testsvc.conf");
    let first = dir.path().join("gen-1");
    let second = dir.path().join("gen-2");

    std::fs::write(
        &config_path,
        format!(
            r#"{{
                "ServiceDescription": {{ "DisplayName": "Demo" }},
                "StartupTasks": [ {{ "Path": "sh", "Args": ["-c", "touch {m}"] }} ]
            }}"#,
            m = first.display()
        ),
    )
    .unwrap();

    let mut supervisor =
        Supervisor::new(dir.path().to_path_buf(), config_path.clone(), "testsvc").unwrap();
    supervisor.start().await;
    assert!(first.exists());

    std::fs::write(
        &config_path,
        format!(
            r#"{{
                "ServiceDescription": {{ "DisplayName": "Demo" }},
                "StartupTasks": [ {{ "Path": "sh", "Args": ["-c", "touch {m}"] }} ]
            }}"#,
            m = second.display()
        ),
    )
    .unwrap();

    supervisor.reload().await;
    assert!(second.exists(), "reload must run the new generation's tasks");
    supervisor.stop().await;
}

#[tokio::test]
async fn test_reload_keeps_previous_config_on_parse_error() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("testsvc.conf");
    let counter = dir.path().join("generations");

    std::fs::write(
        &config_path,
        format!(
            r#"{{
                "ServiceDescription": {{ "DisplayName": "Demo" }},
                "StartupTasks": [ {{ "Path": "sh", "Args": ["-c", "echo x >> {c}"] }} ]
            }}"#,
            c = counter.display()
        ),
    )
    .unwrap();

    let mut supervisor =
        Supervisor::new(dir.path().to_path_buf(), config_path.clone(), "testsvc").unwrap();
    supervisor.start().await;

    std::fs::write(&config_path, "{ broken json").unwrap();
    supervisor.reload().await;
    supervisor.stop().await;

    let generations = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(
        generations, 2,
        "the previous config must keep running after a failed reload"
    );
}

#[tokio::test]
async fn test_crashing_service_is_not_restarted_past_budget() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("attempts");

    let json = format!(
        r#"{{
            "ServiceDescription": {{ "DisplayName": "Demo" }},
            "Services": [
                {{ "Path": "sh", "Args": ["-c", "echo x >> {c}; exit 1"],
                   "MaxCrashCountPerHour": 3 }}
            ]
        }}"#,
        c = counter.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    supervisor.start().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    supervisor.stop().await;

    let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(attempts, 3, "service must stop at its crash budget");
}

#[tokio::test]
async fn test_environment_exported_to_children() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("env-out");

    // SILVER_SERVICE_* keys are process-wide and parallel tests share the
    // environment, so assertions stick to this test's own variable.
    let json = format!(
        r#"{{
            "ServiceDescription": {{ "Name": "testsvc", "DisplayName": "Demo" }},
            "EnvironmentVars": {{ "SILVER_ENV_EXPORT_TEST": "from-config" }},
            "StartupTasks": [
                {{ "Path": "sh",
                   "Args": ["-c", "echo $SILVER_ENV_EXPORT_TEST > {out}"] }}
            ]
        }}"#,
        out = out.display()
    );
    let mut supervisor = supervisor_for(dir.path(), &json);

    supervisor.start().await;
    supervisor.stop().await;

    let contents = std::fs::read_to_string(&out).unwrap();
    assert!(contents.contains("from-config"));
}
