use std::io;
use std::time::Duration;

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    fn send_signal(pid: u32, signal: Option<Signal>) -> io::Result<()> {
        kill(Pid::from_raw(pid as i32), signal).map_err(io::Error::other)
    }

    pub fn is_running(pid: u32) -> bool {
        // Zero-signal probe
        send_signal(pid, None).is_ok()
    }

    /// Ask the process to exit cleanly. Both SIGINT and SIGTERM are sent so
    /// that console-style and daemon-style children are covered; the first
    /// error wins but both signals are attempted.
    pub fn signal_quit(pid: u32) -> io::Result<()> {
        let r1 = send_signal(pid, Some(Signal::SIGINT));
        let r2 = send_signal(pid, Some(Signal::SIGTERM));
        r1?;
        r2
    }

    pub fn kill_hard(pid: u32) -> io::Result<()> {
        send_signal(pid, Some(Signal::SIGKILL))
    }

    pub fn apply_process_group(_cmd: &mut tokio::process::Command) {
        // Only required on Windows so CTRL_BREAK targets the child alone.
    }
}

// =========================================================================
// Windows implementation
// =========================================================================

#[cfg(windows)]
mod platform {
    use super::*;

    const STILL_ACTIVE: u32 = 259;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub fn is_running(pid: u32) -> bool {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION,
        };

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_INFORMATION, 0, pid);
            if handle == 0 {
                return false;
            }
            let mut exit_code: u32 = 0;
            let result = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);
            result != 0 && exit_code == STILL_ACTIVE
        }
    }

    /// Ask the process to exit cleanly. Console children get CTRL_BREAK
    /// (they must have been spawned into their own process group); windowed
    /// children get WM_CLOSE posted to every top-level window they own.
    /// Both paths are attempted; the first error wins.
    pub fn signal_quit(pid: u32) -> io::Result<()> {
        let r1 = send_ctrl_break(pid);
        let r2 = post_wm_close(pid);
        r1?;
        r2
    }

    fn send_ctrl_break(pid: u32) -> io::Result<()> {
        use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

        unsafe {
            if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn post_wm_close(pid: u32) -> io::Result<()> {
        use windows_sys::Win32::UI::WindowsAndMessaging::EnumWindows;

        unsafe extern "system" fn close_window(hwnd: isize, lparam: isize) -> i32 {
            use windows_sys::Win32::UI::WindowsAndMessaging::{
                GetWindowThreadProcessId, PostMessageW, WM_CLOSE,
            };
            unsafe {
                let mut window_pid: u32 = 0;
                GetWindowThreadProcessId(hwnd, &mut window_pid);
                if window_pid == lparam as u32 {
                    PostMessageW(hwnd, WM_CLOSE, 0, 0);
                }
            }
            1 // continue enumeration
        }

        unsafe {
            if EnumWindows(Some(close_window), pid as isize) == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn kill_hard(pid: u32) -> io::Result<()> {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_TERMINATE, TerminateProcess,
        };

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle == 0 {
                return Err(io::Error::last_os_error());
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn apply_process_group(cmd: &mut tokio::process::Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

pub use platform::*;

// =========================================================================
// Graceful kill
// =========================================================================

const CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Ask the process to quit and give it `max_wait` to comply, polling at a
/// 500 ms cadence. On timeout the process is hard-killed; the hard-kill
/// error is returned if it fires, otherwise Ok.
pub async fn kill_gracefully(pid: u32, max_wait: Duration) -> io::Result<()> {
    signal_quit(pid)?;

    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(CHECK_PERIOD.min(deadline - now)).await;
        if !is_running(pid) {
            return Ok(());
        }
    }

    kill_hard(pid)
}
