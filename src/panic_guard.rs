use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Persistent crash counter, JSON `{Timestamp, CrashCount}`.
pub const LAST_CRASH_FILE: &str = "silver.lastcrash";

pub const DEFAULT_CRASH_LOG: &str = "crashlog.log";

/// Restarts are abandoned once this many crashes land inside one hour.
pub const MAX_CRASH_COUNT: u32 = 5;

/// Exit code for the abort path.
pub const ABORT_EXIT_CODE: i32 = 2;

const DEBOUNCE_FACTOR: Duration = Duration::from_secs(1);

fn crash_window() -> chrono::Duration {
    chrono::Duration::hours(1)
}

// Counter file access is read-modify-write; one install root is owned by a
// single supervisor process, so a process-wide mutex is sufficient.
static CRASH_FILE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LastCrash {
    pub timestamp: DateTime<Utc>,
    pub crash_count: u32,
}

pub fn read_last_crash(dir: &Path) -> Option<LastCrash> {
    let data = std::fs::read(dir.join(LAST_CRASH_FILE)).ok()?;
    serde_json::from_slice(&data).ok()
}

pub fn write_last_crash(dir: &Path, last: &LastCrash) -> std::io::Result<()> {
    let data = serde_json::to_vec(last)?;
    std::fs::write(dir.join(LAST_CRASH_FILE), data)
}

/// Throttle crash restarts. Returns true when the supervisor has crashed too
/// often and should abort instead of restarting.
///
/// A missing or stale (older than one hour) counter resets to 1. Otherwise
/// the counter is incremented and the caller is delayed `count x 1 s` before
/// the restart proceeds.
pub fn debounce(dir: &Path) -> bool {
    let _guard = CRASH_FILE_LOCK.lock();
    let now = Utc::now();

    let fresh = LastCrash {
        timestamp: now,
        crash_count: 1,
    };

    let Some(last) = read_last_crash(dir) else {
        let _ = write_last_crash(dir, &fresh);
        return false;
    };

    if now - last.timestamp > crash_window() {
        let _ = write_last_crash(dir, &fresh);
        return false;
    }

    if last.crash_count >= MAX_CRASH_COUNT {
        return true;
    }

    let count = last.crash_count + 1;
    std::thread::sleep(DEBOUNCE_FACTOR * count);
    let _ = write_last_crash(
        dir,
        &LastCrash {
            timestamp: now,
            crash_count: count,
        },
    );
    false
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn crash_log_line(dir: &Path, crash_log_file: &str, message: &str) {
    let line = format!(
        "{} {message}\n",
        chrono::Local::now().format(crate::logging::DEFAULT_TIMESTAMP_FORMAT)
    );
    let target = dir.join(crash_log_file);
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&target)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if written.is_err() {
        let _ = std::io::stderr().write_all(line.as_bytes());
    }
}

/// Handle an unrecovered supervisor panic: log it, debounce, signal children
/// via the stop file, then re-exec the original command line. Returns the
/// process exit code.
pub fn handle_panic(
    dir: &Path,
    crash_log_file: &str,
    stop_file: Option<&str>,
    payload: Box<dyn std::any::Any + Send>,
) -> i32 {
    let crash_log = if crash_log_file.is_empty() {
        DEFAULT_CRASH_LOG
    } else {
        crash_log_file
    };

    if debounce(dir) {
        crash_log_line(dir, crash_log, "service crashed too many times. bailing...");
        return ABORT_EXIT_CODE;
    }

    crash_log_line(
        dir,
        crash_log,
        "service is crashing; waiting for all sub-services to terminate",
    );
    crash_log_line(
        dir,
        crash_log,
        &format!("panic: {}", payload_message(payload.as_ref())),
    );

    // The crashed generation unwound with the runtime, so children are
    // drained cooperatively through the stop file they may poll.
    if let Some(stop_file) = stop_file
        && stop_file != crate::config::DISABLED
    {
        let _ = std::fs::write(dir.join(stop_file), "");
    }

    match restart_self() {
        Ok(()) => crash_log_line(dir, crash_log, "started replacement instance"),
        Err(e) => crash_log_line(dir, crash_log, &format!("failed to restart: {e}")),
    }

    1
}

fn restart_self() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    std::process::Command::new(exe).args(args).spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_round_trip_uses_wire_keys() {
        let dir = tempfile::tempdir().unwrap();
        let last = LastCrash {
            timestamp: Utc::now(),
            crash_count: 3,
        };
        write_last_crash(dir.path(), &last).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(LAST_CRASH_FILE)).unwrap();
        assert!(raw.contains("Timestamp"));
        assert!(raw.contains("CrashCount"));

        assert_eq!(read_last_crash(dir.path()).unwrap(), last);
    }

    #[test]
    fn test_first_crash_initializes_counter() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!debounce(dir.path()));
        assert_eq!(read_last_crash(dir.path()).unwrap().crash_count, 1);
    }

    #[test]
    fn test_stale_counter_resets() {
        let dir = tempfile::tempdir().unwrap();
        write_last_crash(
            dir.path(),
            &LastCrash {
                timestamp: Utc::now() - chrono::Duration::hours(2),
                crash_count: 4,
            },
        )
        .unwrap();

        assert!(!debounce(dir.path()));
        assert_eq!(read_last_crash(dir.path()).unwrap().crash_count, 1);
    }

    #[test]
    fn test_counter_increments_within_window() {
        let dir = tempfile::tempdir().unwrap();
        write_last_crash(
            dir.path(),
            &LastCrash {
                timestamp: Utc::now(),
                crash_count: 1,
            },
        )
        .unwrap();

        assert!(!debounce(dir.path()));
        assert_eq!(read_last_crash(dir.path()).unwrap().crash_count, 2);
    }

    #[test]
    fn test_abort_at_max_crash_count() {
        let dir = tempfile::tempdir().unwrap();
        write_last_crash(
            dir.path(),
            &LastCrash {
                timestamp: Utc::now(),
                crash_count: MAX_CRASH_COUNT,
            },
        )
        .unwrap();

        assert!(debounce(dir.path()));
        // The counter is left as-is on the abort path.
        assert_eq!(
            read_last_crash(dir.path()).unwrap().crash_count,
            MAX_CRASH_COUNT
        );
    }

    #[test]
    fn test_corrupt_counter_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LAST_CRASH_FILE), "not json").unwrap();
        assert!(!debounce(dir.path()));
        assert_eq!(read_last_crash(dir.path()).unwrap().crash_count, 1);
    }
}
