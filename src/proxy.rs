use std::io;
use std::path::Path;

/// Plain-text proxy URL, one line, next to the executable.
pub const PROXY_CONF_FILE: &str = "http-proxy.conf";

pub const SILVER_HTTP_PROXY_ENV: &str = "SILVER_HTTP_PROXY";
pub const HTTP_PROXY_ENV: &str = "HTTP_PROXY";

pub fn read_proxy_conf(dir: &Path) -> Option<String> {
    let text = std::fs::read_to_string(dir.join(PROXY_CONF_FILE)).ok()?;
    let proxy = text.trim();
    if proxy.is_empty() {
        None
    } else {
        Some(proxy.to_string())
    }
}

pub fn persist_proxy(dir: &Path, proxy: &str) -> io::Result<()> {
    std::fs::write(dir.join(PROXY_CONF_FILE), format!("{proxy}\n"))
}

/// Persist the proxy currently visible to this process so the updater can
/// reach out even when it runs without the interactive user's environment.
pub fn persist_current_proxy(dir: &Path) -> io::Result<()> {
    let current = std::env::var(HTTP_PROXY_ENV)
        .or_else(|_| std::env::var("HTTPS_PROXY"))
        .unwrap_or_default();
    if current.is_empty() {
        return Ok(());
    }
    persist_proxy(dir, &current)
}

/// Resolve the proxy for update requests: explicit flag, then the
/// supervisor-exported environment, then the conf file.
pub fn discover_proxy(flag: Option<&str>, dir: &Path) -> Option<String> {
    if let Some(proxy) = flag
        && !proxy.is_empty()
    {
        return Some(proxy.to_string());
    }
    if let Ok(proxy) = std::env::var(SILVER_HTTP_PROXY_ENV)
        && !proxy.is_empty()
    {
        return Some(proxy);
    }
    read_proxy_conf(dir)
}
