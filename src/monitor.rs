use crate::logging::Logger;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use url::Url;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub url: String,
    pub startup_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub restart_on_failure_count: u32,
}

impl From<&crate::config::MonitorPing> for MonitorConfig {
    fn from(ping: &crate::config::MonitorPing) -> Self {
        Self {
            url: ping.url.clone(),
            startup_delay: Duration::from_secs(ping.startup_delay_secs),
            interval: Duration::from_secs(ping.interval_secs),
            timeout: Duration::from_secs(ping.timeout_secs),
            restart_on_failure_count: ping.restart_on_failure_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Probe outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid ping URL")]
    InvalidUrl,
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("{0}")]
    Io(String),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("server did not echo")]
    NoEcho,
    #[error("file {0} did not change")]
    FileUnchanged(String),
}

/// Outcome of a single liveness probe.
///
/// `Down` feeds the failure counter. `Indeterminate` is the fail-open case
/// (malformed URL, unsupported scheme, unreadable file): the error is logged
/// but the counter resets, so a misconfigured monitor never kills a healthy
/// service.
#[derive(Debug)]
pub enum Probe {
    Up,
    Down(MonitorError),
    Indeterminate(MonitorError),
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

pub async fn ping_url(client: &reqwest::Client, raw: &str, timeout: Duration) -> Probe {
    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return Probe::Indeterminate(MonitorError::InvalidUrl),
    };

    match parsed.scheme().to_lowercase().as_str() {
        "tcp" => ping_tcp(&host_port(&parsed), timeout).await,
        "echo" => ping_echo(&host_port(&parsed), timeout).await,
        "http" | "https" => ping_http(client, raw, timeout).await,
        "file" => ping_file(raw),
        other => Probe::Indeterminate(MonitorError::UnsupportedScheme(other.to_string())),
    }
}

fn host_port(u: &Url) -> String {
    let host = u.host_str().unwrap_or_default();
    match u.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

async fn ping_tcp(addr: &str, timeout: Duration) -> Probe {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(conn)) => {
            drop(conn);
            Probe::Up
        }
        Ok(Err(e)) => Probe::Down(MonitorError::Io(e.to_string())),
        Err(_) => Probe::Down(MonitorError::Io(format!("connect to {addr} timed out"))),
    }
}

/// Challenge the server with a unique token; the reply must contain it.
async fn ping_echo(addr: &str, timeout: Duration) -> Probe {
    let attempt = async {
        let mut conn = TcpStream::connect(addr).await?;
        let token = format!(
            "ping-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        conn.write_all(token.as_bytes()).await?;
        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await?;
        Ok::<_, std::io::Error>((token, String::from_utf8_lossy(&buf[..n]).into_owned()))
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok((token, reply))) if reply.contains(&token) => Probe::Up,
        Ok(Ok(_)) => Probe::Down(MonitorError::NoEcho),
        Ok(Err(e)) => Probe::Down(MonitorError::Io(e.to_string())),
        Err(_) => Probe::Down(MonitorError::Io(format!("echo to {addr} timed out"))),
    }
}

async fn ping_http(client: &reqwest::Client, url: &str, timeout: Duration) -> Probe {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            // Drain the body so keep-alive connections are reusable.
            let _ = resp.bytes().await;
            if status == 200 {
                Probe::Up
            } else {
                Probe::Down(MonitorError::HttpStatus(status))
            }
        }
        Err(e) => Probe::Down(MonitorError::Io(e.to_string())),
    }
}

type FileStamp = (u64, u128);

fn file_stamp_cache() -> &'static Mutex<HashMap<String, FileStamp>> {
    static CACHE: OnceLock<Mutex<HashMap<String, FileStamp>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Healthy iff the file's (size, mtime) stamp moved since the last probe of
/// that path. The stamp cache is process-wide.
fn ping_file(raw: &str) -> Probe {
    let path = raw.trim_start_matches("file://");
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => return Probe::Indeterminate(MonitorError::Io(e.to_string())),
    };

    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let stamp: FileStamp = (meta.len(), modified);

    let Ok(mut cache) = file_stamp_cache().lock() else {
        return Probe::Indeterminate(MonitorError::Io("stamp cache poisoned".to_string()));
    };
    match cache.get(path) {
        Some(previous) if *previous == stamp => {
            Probe::Down(MonitorError::FileUnchanged(path.to_string()))
        }
        _ => {
            cache.insert(path.to_string(), stamp);
            Probe::Up
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor loop
// ---------------------------------------------------------------------------

pub struct ServiceMonitor {
    pub service_name: String,
    pub config: MonitorConfig,
    pub logger: Logger,
}

impl ServiceMonitor {
    /// Probe the service on an interval until the failure counter trips,
    /// then fire the returned trigger. A terminate during the startup delay
    /// cancels the monitor without ever probing.
    pub fn start(self, terminate: CancellationToken) -> CancellationToken {
        let trigger = CancellationToken::new();
        let fire = trigger.clone();

        tokio::spawn(async move {
            let name = &self.service_name;
            let interval = if self.config.interval.is_zero() {
                DEFAULT_INTERVAL
            } else {
                self.config.interval
            };
            let timeout = if self.config.timeout.is_zero() {
                DEFAULT_TIMEOUT
            } else {
                self.config.timeout
            };

            if !self.config.startup_delay.is_zero() {
                tokio::select! {
                    _ = terminate.cancelled() => return,
                    _ = tokio::time::sleep(self.config.startup_delay) => {}
                }
            }

            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(c) => c,
                Err(e) => {
                    self.logger
                        .log(&format!("{name}: Monitor failed to build HTTP client: {e}"));
                    return;
                }
            };

            let mut failure_count: u32 = 0;
            loop {
                tokio::select! {
                    _ = terminate.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                match ping_url(&client, &self.config.url, timeout).await {
                    Probe::Up => failure_count = 0,
                    Probe::Indeterminate(err) => {
                        self.logger.log(&format!("{name}: Monitor ping error '{err}'"));
                        failure_count = 0;
                    }
                    Probe::Down(err) => {
                        failure_count += 1;
                        self.logger
                            .log(&format!("{name}: Monitor detected error - '{err}'"));
                    }
                }

                if failure_count > self.config.restart_on_failure_count {
                    self.logger.log(&format!(
                        "{name}: Service not responding. Forcing shutdown. (failures: {failure_count})"
                    ));
                    fire.cancel();
                    return;
                }
            }
        });

        trigger
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
