// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform low-level process control: spawn from an argv-style
// command line, liveness probe, graceful/forced termination, exit wait.
// POSIX uses posix_spawn/kill/waitpid; Windows uses CreateProcess and
// the process handle APIs.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// Handle to a spawned child process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    #[cfg(windows)]
    hprocess: isize, // HANDLE
}

impl ProcessHandle {
    /// Spawn a child from `command_line`; element 0 is the executable path,
    /// the rest are arguments.
    pub fn spawn(command_line: &[String]) -> io::Result<Self> {
        if command_line.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            ));
        }

        #[cfg(unix)]
        {
            use std::ffi::CString;

            extern "C" {
                static mut environ: *mut *mut libc::c_char;
            }

            let mut argv: Vec<CString> = Vec::with_capacity(command_line.len());
            for a in command_line {
                argv.push(
                    CString::new(a.as_str())
                        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in argv"))?,
                );
            }
            let mut argv_ptrs: Vec<*mut libc::c_char> = argv
                .iter()
                .map(|s| s.as_ptr() as *mut libc::c_char)
                .collect();
            argv_ptrs.push(std::ptr::null_mut());

            let mut pid: libc::pid_t = -1;
            let err = unsafe {
                libc::posix_spawn(
                    &mut pid,
                    argv[0].as_ptr(),
                    std::ptr::null(),
                    std::ptr::null(),
                    argv_ptrs.as_mut_ptr(),
                    environ,
                )
            };
            if err != 0 {
                return Err(io::Error::from_raw_os_error(err));
            }
            debug!(pid, executable = %command_line[0], "spawned child");
            Ok(Self { pid: pid as u32 })
        }

        #[cfg(windows)]
        {
            use windows_sys::Win32::Foundation::CloseHandle;
            use windows_sys::Win32::System::Threading::{
                CreateProcessA, PROCESS_INFORMATION, STARTUPINFOA,
            };

            let mut cmdline = command_line.join(" ");
            cmdline.push('\0');

            let mut si: STARTUPINFOA = unsafe { std::mem::zeroed() };
            si.cb = std::mem::size_of::<STARTUPINFOA>() as u32;
            let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

            let ok = unsafe {
                CreateProcessA(
                    std::ptr::null(),
                    cmdline.as_mut_ptr(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    0,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null(),
                    &si,
                    &mut pi,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                CloseHandle(pi.hThread);
            }
            debug!(pid = pi.dwProcessId, executable = %command_line[0], "spawned child");
            Ok(Self {
                pid: pi.dwProcessId,
                hprocess: pi.hProcess as isize,
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process spawning not supported on this platform",
            ))
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Liveness probe. Note: a zombie still counts as alive until reaped.
    pub fn is_alive(&self) -> bool {
        #[cfg(unix)]
        {
            is_pid_alive(self.pid as i32)
        }
        #[cfg(windows)]
        {
            use windows_sys::Win32::Foundation::STILL_ACTIVE;
            use windows_sys::Win32::System::Threading::GetExitCodeProcess;
            unsafe {
                let mut code: u32 = 0;
                GetExitCodeProcess(self.hprocess as _, &mut code) != 0 && code == STILL_ACTIVE as u32
            }
        }
        #[cfg(not(any(unix, windows)))]
        {
            false
        }
    }

    /// Ask the child to exit: SIGTERM on POSIX, TerminateProcess on Windows.
    pub fn request_shutdown(&self) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) == 0 }
        }
        #[cfg(windows)]
        {
            unsafe { windows_sys::Win32::System::Threading::TerminateProcess(self.hprocess as _, 1) != 0 }
        }
        #[cfg(not(any(unix, windows)))]
        {
            false
        }
    }

    /// SIGKILL on POSIX, TerminateProcess(9) on Windows.
    pub fn force_kill(&self) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) == 0 }
        }
        #[cfg(windows)]
        {
            unsafe { windows_sys::Win32::System::Threading::TerminateProcess(self.hprocess as _, 9) != 0 }
        }
        #[cfg(not(any(unix, windows)))]
        {
            false
        }
    }

    /// Wait for the child to exit, polling with `WNOHANG` up to `timeout`.
    /// Returns immediately if it has already exited.
    pub fn wait_for_exit(&self, timeout: Duration) -> WaitResult {
        let mut r = WaitResult::default();

        #[cfg(unix)]
        {
            let deadline = Instant::now() + timeout;
            loop {
                let mut status: libc::c_int = 0;
                let ret =
                    unsafe { libc::waitpid(self.pid as libc::pid_t, &mut status, libc::WNOHANG) };
                if ret == self.pid as libc::pid_t {
                    if libc::WIFEXITED(status) {
                        r.exited = true;
                        r.exit_code = libc::WEXITSTATUS(status);
                    }
                    if libc::WIFSIGNALED(status) {
                        r.signaled = true;
                        r.signal = libc::WTERMSIG(status);
                    }
                    return r;
                }
                if ret == -1 {
                    // Not our child or already reaped; fall back to a liveness poll.
                    if !self.is_alive() {
                        r.exited = true;
                    }
                    return r;
                }
                if Instant::now() >= deadline {
                    return r;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        #[cfg(windows)]
        {
            use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
            use windows_sys::Win32::System::Threading::{GetExitCodeProcess, WaitForSingleObject};
            let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
            let ret = unsafe { WaitForSingleObject(self.hprocess as _, ms) };
            if ret == WAIT_OBJECT_0 {
                let mut code: u32 = 0;
                unsafe {
                    GetExitCodeProcess(self.hprocess as _, &mut code);
                }
                r.exited = true;
                r.exit_code = code as i32;
            }
            r
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = timeout;
            r
        }
    }

    /// Graceful shutdown escalation: request exit, wait `grace`, force-kill
    /// if still alive.
    pub fn shutdown(&self, grace: Duration) -> WaitResult {
        self.request_shutdown();
        let r = self.wait_for_exit(grace);
        if !r.exited && !r.signaled && self.is_alive() {
            warn!(pid = self.pid, "child ignored shutdown request, killing");
            self.force_kill();
            return self.wait_for_exit(Duration::from_secs(1));
        }
        r
    }
}

#[cfg(windows)]
impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.hprocess != 0 {
            unsafe {
                windows_sys::Win32::Foundation::CloseHandle(self.hprocess as _);
            }
            self.hprocess = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// WaitResult
// ---------------------------------------------------------------------------

/// Result of a [`ProcessHandle::wait_for_exit`] call.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitResult {
    pub exited: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub signal: i32,
}

// ---------------------------------------------------------------------------
// Liveness probe by pid
// ---------------------------------------------------------------------------

/// Whether `pid` names a live process.
#[cfg(unix)]
pub fn is_pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe {
        libc::kill(pid, 0) == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

#[cfg(windows)]
pub fn is_pid_alive(pid: i32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    if pid <= 0 {
        return false;
    }
    unsafe {
        let h = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid as u32);
        if h.is_null() {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(h, &mut code) != 0 && code == STILL_ACTIVE as u32;
        CloseHandle(h);
        ok
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_pid_alive(_pid: i32) -> bool {
    false
}
