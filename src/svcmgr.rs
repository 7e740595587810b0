//! OS service registration shim. The supervisor itself is host-agnostic;
//! this module only writes/removes the platform's service definition and
//! drives its control tool. The installed unit runs `<exe> run`, the same
//! code path as foreground mode.

use color_eyre::eyre::{WrapErr, bail};
use std::path::{Path, PathBuf};

pub struct ServiceIdentity {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

pub fn install(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    let exe = std::env::current_exe().wrap_err("could not determine executable path")?;
    platform_install(identity, &exe)
}

pub fn uninstall(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    platform_uninstall(identity)
}

pub fn start(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    platform_start(identity)
}

pub fn stop(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    platform_stop(identity)
}

pub fn generate_systemd_unit(identity: &ServiceIdentity, exe_path: &str) -> String {
    let work_dir = Path::new(exe_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    format!(
        r#"[Unit]
Description={display} - {description}
After=network.target

[Service]
Type=simple
ExecStart={exe_path} run
WorkingDirectory={work_dir}
Restart=on-failure

[Install]
WantedBy=default.target
"#,
        display = identity.display_name,
        description = identity.description,
    )
}

pub fn generate_launchd_plist(identity: &ServiceIdentity, exe_path: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe_path}</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
        label = launchd_label(&identity.name),
    )
}

pub fn launchd_label(name: &str) -> String {
    format!("com.silver.{name}")
}

fn run_control_tool(tool: &str, args: &[&str]) -> color_eyre::Result<()> {
    let status = std::process::Command::new(tool)
        .args(args)
        .status()
        .wrap_err_with(|| format!("could not run {tool}"))?;
    if !status.success() {
        bail!("{tool} {} exited with {status}", args.join(" "));
    }
    Ok(())
}

// -- Linux: user-level systemd unit ---------------------------------------

#[cfg(target_os = "linux")]
fn service_file_path(name: &str) -> color_eyre::Result<PathBuf> {
    let home = std::env::var("HOME").wrap_err("could not determine home directory")?;
    Ok(PathBuf::from(home).join(format!(".config/systemd/user/{name}.service")))
}

#[cfg(target_os = "linux")]
fn platform_install(identity: &ServiceIdentity, exe: &Path) -> color_eyre::Result<()> {
    let path = service_file_path(&identity.name)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("could not create directory {}", parent.display()))?;
    }
    std::fs::write(&path, generate_systemd_unit(identity, &exe.to_string_lossy()))
        .wrap_err_with(|| format!("could not write service file {}", path.display()))?;
    eprintln!("Service installed: {}", path.display());

    run_control_tool("systemctl", &["--user", "daemon-reload"])?;
    run_control_tool("systemctl", &["--user", "enable", &identity.name])
}

#[cfg(target_os = "linux")]
fn platform_uninstall(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    let path = service_file_path(&identity.name)?;
    if !path.exists() {
        eprintln!("No service file found at {}", path.display());
        return Ok(());
    }
    let _ = run_control_tool("systemctl", &["--user", "disable", &identity.name]);
    std::fs::remove_file(&path)
        .wrap_err_with(|| format!("could not remove service file {}", path.display()))?;
    run_control_tool("systemctl", &["--user", "daemon-reload"])?;
    eprintln!("Service removed: {}", path.display());
    Ok(())
}

#[cfg(target_os = "linux")]
fn platform_start(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("systemctl", &["--user", "start", &identity.name])
}

#[cfg(target_os = "linux")]
fn platform_stop(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("systemctl", &["--user", "stop", &identity.name])
}

// -- macOS: launchd agent ---------------------------------------------------

#[cfg(target_os = "macos")]
fn service_file_path(name: &str) -> color_eyre::Result<PathBuf> {
    let home = std::env::var("HOME").wrap_err("could not determine home directory")?;
    Ok(PathBuf::from(home).join(format!("Library/LaunchAgents/{}.plist", launchd_label(name))))
}

#[cfg(target_os = "macos")]
fn platform_install(identity: &ServiceIdentity, exe: &Path) -> color_eyre::Result<()> {
    let path = service_file_path(&identity.name)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("could not create directory {}", parent.display()))?;
    }
    std::fs::write(&path, generate_launchd_plist(identity, &exe.to_string_lossy()))
        .wrap_err_with(|| format!("could not write service file {}", path.display()))?;
    eprintln!("Service installed: {}", path.display());
    run_control_tool("launchctl", &["load", &path.to_string_lossy()])
}

#[cfg(target_os = "macos")]
fn platform_uninstall(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    let path = service_file_path(&identity.name)?;
    if !path.exists() {
        eprintln!("No service file found at {}", path.display());
        return Ok(());
    }
    let _ = run_control_tool("launchctl", &["unload", &path.to_string_lossy()]);
    std::fs::remove_file(&path)
        .wrap_err_with(|| format!("could not remove service file {}", path.display()))?;
    eprintln!("Service removed: {}", path.display());
    Ok(())
}

#[cfg(target_os = "macos")]
fn platform_start(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("launchctl", &["start", &launchd_label(&identity.name)])
}

#[cfg(target_os = "macos")]
fn platform_stop(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("launchctl", &["stop", &launchd_label(&identity.name)])
}

// -- Windows: SCM via sc.exe -------------------------------------------------

#[cfg(windows)]
fn platform_install(identity: &ServiceIdentity, exe: &Path) -> color_eyre::Result<()> {
    let bin_path = format!("\"{}\" run", exe.display());
    run_control_tool(
        "sc.exe",
        &[
            "create",
            &identity.name,
            "binPath=",
            &bin_path,
            "DisplayName=",
            &identity.display_name,
            "start=",
            "auto",
        ],
    )?;
    if !identity.description.is_empty() {
        run_control_tool(
            "sc.exe",
            &["description", &identity.name, &identity.description],
        )?;
    }
    Ok(())
}

#[cfg(windows)]
fn platform_uninstall(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("sc.exe", &["delete", &identity.name])
}

#[cfg(windows)]
fn platform_start(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("sc.exe", &["start", &identity.name])
}

#[cfg(windows)]
fn platform_stop(identity: &ServiceIdentity) -> color_eyre::Result<()> {
    run_control_tool("sc.exe", &["stop", &identity.name])
}

// -- Other platforms ----------------------------------------------------------

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn platform_install(_identity: &ServiceIdentity, _exe: &Path) -> color_eyre::Result<()> {
    bail!("service installation is not supported on this platform");
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn platform_uninstall(_identity: &ServiceIdentity) -> color_eyre::Result<()> {
    bail!("service removal is not supported on this platform");
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn platform_start(_identity: &ServiceIdentity) -> color_eyre::Result<()> {
    bail!("service control is not supported on this platform");
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn platform_stop(_identity: &ServiceIdentity) -> color_eyre::Result<()> {
    bail!("service control is not supported on this platform");
}
