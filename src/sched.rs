use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression '{expression}': {message}")]
pub struct ScheduleError {
    pub expression: String,
    pub message: String,
}

/// Parse a cron expression.
///
/// The `cron` crate requires 6 or 7 fields (sec min hour day month dow
/// [year]); classic 5-field expressions are widened by prepending "0"
/// seconds and appending a "*" year.
pub fn parse_cron_expression(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let field_count = trimmed.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {trimmed} *")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError {
        expression: expr.to_string(),
        message: e.to_string(),
    })
}

pub fn next_run_duration(schedule: &Schedule) -> Option<std::time::Duration> {
    let now = Utc::now();
    let next = schedule.upcoming(Utc).next()?;
    (next - now).to_std().ok()
}

type TaskFn = Arc<dyn Fn() + Send + Sync>;

/// Cron-driven task firing. Each registered entry gets its own loop that
/// sleeps until the next scheduled time and invokes the callback; `stop`
/// cancels all pending fires. Callbacks are expected to hand long work off
/// to the caller's tracker rather than block the schedule.
#[derive(Default)]
pub struct Scheduler {
    cancel: CancellationToken,
    pending: Vec<(Schedule, TaskFn)>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pending: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn add_task(&mut self, schedule: Schedule, run: impl Fn() + Send + Sync + 'static) {
        self.pending.push((schedule, Arc::new(run)));
    }

    pub fn start(&mut self) {
        for (schedule, run) in self.pending.drain(..) {
            let cancel = self.cancel.clone();
            self.handles.push(tokio::spawn(async move {
                loop {
                    let Some(sleep_for) = next_run_duration(&schedule) else {
                        return;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                    run();
                }
            }));
        }
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
