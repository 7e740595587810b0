use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fallback rotation threshold when the config supplies none.
pub const DEFAULT_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// Backups kept beyond the live file (`name.1` .. `name.N`).
pub const DEFAULT_MAX_BACKUPS: u32 = 1;

/// Default line header: date + time. A non-empty `LogFileTimestampFormat`
/// replaces this verbatim, so lines are never double-stamped.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S ";

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Rolling file
// ---------------------------------------------------------------------------

struct RollingFile {
    path: PathBuf,
    max_size: u64,
    max_backups: u32,
    writer: BufWriter<File>,
    current_size: u64,
}

impl RollingFile {
    fn open(path: PathBuf, max_size: u64, max_backups: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            path,
            max_size,
            max_backups,
            writer: BufWriter::new(file),
            current_size,
        })
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        if self.current_size + line.len() as u64 >= self.max_size {
            self.roll()?;
        }
        self.writer.write_all(line)?;
        self.current_size += line.len() as u64;
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        rotate_backups(&self.path, self.max_backups)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.current_size = 0;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Shift rotated backups one slot up and retire the live file to `.1`.
///
/// Renames run from the highest index down so `name.(i-1)` becomes `name.i`;
/// the oldest backup beyond `max_backups` is deleted. With `max_backups == 0`
/// the live file is simply removed.
pub fn rotate_backups(path: &Path, max_backups: u32) -> io::Result<()> {
    if max_backups == 0 {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }

    let oldest = backup_path(path, max_backups);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }

    for i in (1..max_backups).rev() {
        let from = backup_path(path, i);
        let to = backup_path(path, i + 1);
        if from.exists() {
            std::fs::rename(&from, &to)?;
        }
    }

    if path.exists() {
        std::fs::rename(path, backup_path(path, 1))?;
    }

    Ok(())
}

pub fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

// ---------------------------------------------------------------------------
// Open-file registry (close_all is a test hook)
// ---------------------------------------------------------------------------

type Registry = Mutex<HashMap<PathBuf, Arc<Mutex<RollingFile>>>>;

fn registry() -> &'static Registry {
    static OPEN_LOG_FILES: OnceLock<Registry> = OnceLock::new();
    OPEN_LOG_FILES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Flush and forget every open rolling log file.
pub fn close_all_open_logs() {
    if let Ok(mut map) = registry().lock() {
        for (_, file) in map.drain() {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Sink {
    Rolling {
        file: Arc<Mutex<RollingFile>>,
        flusher: CancellationToken,
    },
    Stderr,
    Memory(Arc<Mutex<Vec<String>>>),
    Null,
}

/// Timestamp-prefixed line logger, cheap to clone into worker tasks.
///
/// The rolling variant owns a background flusher that writes buffered bytes
/// through every 5 s; `close` stops the flusher and performs a final flush.
#[derive(Clone)]
pub struct Logger {
    sink: Sink,
    timestamp_format: Option<String>,
}

impl Logger {
    /// Open (or create) a size-rotated log file. On failure a warning goes to
    /// stderr and a null logger is returned so callers never deal with a
    /// missing logger.
    pub fn rolling(
        path: impl Into<PathBuf>,
        max_size: u64,
        max_backups: u32,
        timestamp_format: Option<String>,
    ) -> Logger {
        let path = path.into();
        let max_size = if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size };

        let file = match RollingFile::open(path.clone(), max_size, max_backups) {
            Ok(f) => Arc::new(Mutex::new(f)),
            Err(e) => {
                eprintln!("WARNING: Unable to set up log file {}: {e}", path.display());
                return Logger::null();
            }
        };

        if let Ok(mut map) = registry().lock() {
            map.insert(path, Arc::clone(&file));
        }

        let flusher = CancellationToken::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let file = Arc::clone(&file);
            let token = flusher.clone();
            handle.spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                            if let Ok(mut f) = file.lock() {
                                let _ = f.flush();
                            }
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
        }

        let format = match timestamp_format {
            Some(f) if !f.is_empty() => Some(f),
            _ => Some(DEFAULT_TIMESTAMP_FORMAT.to_string()),
        };

        Logger {
            sink: Sink::Rolling { file, flusher },
            timestamp_format: format,
        }
    }

    pub fn console() -> Logger {
        Logger {
            sink: Sink::Stderr,
            timestamp_format: Some(DEFAULT_TIMESTAMP_FORMAT.to_string()),
        }
    }

    pub fn null() -> Logger {
        Logger {
            sink: Sink::Null,
            timestamp_format: None,
        }
    }

    /// In-memory capture, unstamped. Used by tests to assert on log lines.
    pub fn memory() -> (Logger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let logger = Logger {
            sink: Sink::Memory(Arc::clone(&lines)),
            timestamp_format: None,
        };
        (logger, lines)
    }

    pub fn log(&self, msg: &str) {
        let line = match &self.timestamp_format {
            Some(fmt) => format!("{}{msg}\n", chrono::Local::now().format(fmt)),
            None => format!("{msg}\n"),
        };

        match &self.sink {
            Sink::Rolling { file, .. } => {
                if let Ok(mut f) = file.lock()
                    && let Err(e) = f.write_line(line.as_bytes())
                {
                    eprintln!("WARNING: log write failed: {e}");
                }
            }
            Sink::Stderr => {
                let _ = io::stderr().write_all(line.as_bytes());
            }
            Sink::Memory(lines) => {
                if let Ok(mut l) = lines.lock() {
                    l.push(msg.to_string());
                }
            }
            Sink::Null => {}
        }
    }

    /// Stop the flusher and write any buffered bytes through.
    pub fn close(&self) {
        if let Sink::Rolling { file, flusher } = &self.sink {
            flusher.cancel();
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}
