//! Severing the executor from the process that launched it.
//!
//! The executor must outlive the web server that started it, so before running the job
//! it leaves the launcher's process group, session and console. [`platform_detacher`]
//! picks the implementation for the current platform.

use super::executor::JobSpec;
use crate::error::{PgDeckError, PgDeckResult};

/// Outcome of a detach for the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detachment {
    /// This process only launched the job and should exit with status 0.
    Launcher { child_pid: u32 },
    /// This process is detached and must run the job.
    Worker,
}

/// Detaches the current process from its launcher.
pub trait Detacher {
    fn detach(&self, spec: &JobSpec) -> PgDeckResult<Detachment>;
}

/// fork + setsid.
///
/// The forked child becomes a session leader, resets its umask and confirms through a
/// pipe; the parent returns [`Detachment::Launcher`] only after the confirmation (or the
/// child's death) closes the pipe. Must be called before any thread is started.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct PosixDetacher;

#[cfg(unix)]
impl Detacher for PosixDetacher {
    fn detach(&self, _spec: &JobSpec) -> PgDeckResult<Detachment> {
        use std::fs::File;
        use std::io::{Read, Write};
        use std::os::fd::FromRawFd;

        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe() writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(os_error("pipe"));
        }
        // SAFETY: both descriptors were just created and are owned by nothing else.
        let (mut reader, mut writer) =
            unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

        // SAFETY: the executor is single-threaded here; no runtime has been built yet.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(os_error("fork")),
            0 => {
                drop(reader);
                tracing::debug!("[CHILD] Forked, becoming session leader");
                // SAFETY: plain syscalls without memory arguments.
                if unsafe { libc::setsid() } == -1 {
                    return Err(os_error("setsid"));
                }
                unsafe { libc::umask(0) };

                tracing::debug!("[CHILD] Informing the parent");
                writer
                    .write_all(b"1")
                    .map_err(|e| PgDeckError::process_with_source("Failed to signal parent", e))?;
                drop(writer);
                Ok(Detachment::Worker)
            }
            child => {
                drop(writer);
                let mut ack = Vec::new();
                reader
                    .read_to_end(&mut ack)
                    .map_err(|e| PgDeckError::process_with_source("Failed to await child", e))?;
                confirm_detach(child, &ack)
            }
        }
    }
}

/// Judge the child's handshake. A child that died before writing it is reaped and the
/// detach fails, so the launcher does not wait for a status that never comes.
#[cfg(unix)]
fn confirm_detach(child: libc::pid_t, ack: &[u8]) -> PgDeckResult<Detachment> {
    if ack.is_empty() {
        let mut wait_status = 0;
        // SAFETY: `child` is our own child; the status pointer is valid for the call.
        unsafe { libc::waitpid(child, &mut wait_status, 0) };
        tracing::error!(child_pid = child, wait_status, "[PARENT] Child died before detaching");
        return Err(PgDeckError::process(format!(
            "Detached process {child} exited before confirming its start"
        )));
    }
    tracing::debug!(child_pid = child, "[PARENT] Done");
    Ok(Detachment::Launcher { child_pid: child as u32 })
}

#[cfg(unix)]
fn os_error(call: &str) -> PgDeckError {
    PgDeckError::process_with_source(format!("{call} failed"), std::io::Error::last_os_error())
}

/// Detached self-relaunch.
///
/// Unless this process already is the relaunched one (`BGP_FOREGROUND=1`), start the
/// executor again with the same arguments in a new process group without a console,
/// give it two seconds to get going and report [`Detachment::Launcher`].
#[cfg(windows)]
#[derive(Debug, Default)]
pub struct WindowsDetacher;

#[cfg(windows)]
impl Detacher for WindowsDetacher {
    fn detach(&self, spec: &JobSpec) -> PgDeckResult<Detachment> {
        use super::executor::FOREGROUND_VAR;
        use std::os::windows::process::CommandExt;
        use std::process::{Command, Stdio};
        use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, DETACHED_PROCESS};

        if std::env::var(FOREGROUND_VAR).as_deref() == Ok("1") {
            tracing::debug!("[CHILD] Running detached");
            return Ok(Detachment::Worker);
        }

        let exe = std::env::current_exe()
            .map_err(|e| PgDeckError::process_with_source("Cannot locate the executor", e))?;
        let child = Command::new(exe)
            .args(std::env::args_os().skip(1))
            .env(FOREGROUND_VAR, "1")
            .current_dir(&spec.out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS)
            .spawn()
            .map_err(|e| PgDeckError::process_with_source("Failed to relaunch detached", e))?;

        tracing::debug!(child_pid = child.id(), "[PARENT] Started the detached executor");
        std::thread::sleep(std::time::Duration::from_secs(2));
        Ok(Detachment::Launcher { child_pid: child.id() })
    }
}

/// Detacher for the current platform.
pub fn platform_detacher() -> Box<dyn Detacher> {
    #[cfg(unix)]
    {
        Box::new(PosixDetacher)
    }
    #[cfg(windows)]
    {
        Box::new(WindowsDetacher)
    }
}

#[cfg(unix)]
extern "C" fn ignore_interrupt(_signal: libc::c_int) {}

/// Keep interrupts aimed at the launcher's process group from killing the executor.
///
/// SIGINT and SIGTERM get a no-op handler rather than an ignore disposition: handlers
/// reset to the default across exec, so the command itself stays cancellable.
#[cfg(unix)]
pub fn isolate_from_interrupts() -> PgDeckResult<()> {
    let handler = ignore_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler is async-signal-safe; it does nothing.
        if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
            return Err(os_error("signal"));
        }
    }
    tracing::debug!("Disabled the SIGINT, SIGTERM signals");
    Ok(())
}

#[cfg(windows)]
unsafe extern "system" fn ignore_console_event(_event: u32) -> i32 {
    1
}

/// Keep console control events (Ctrl+C, Ctrl+Break, close) from killing the executor.
#[cfg(windows)]
pub fn isolate_from_interrupts() -> PgDeckResult<()> {
    use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;

    // SAFETY: registering a handler that only returns TRUE.
    if unsafe { SetConsoleCtrlHandler(Some(ignore_console_event), 1) } == 0 {
        return Err(PgDeckError::process_with_source(
            "SetConsoleCtrlHandler failed",
            std::io::Error::last_os_error(),
        ));
    }
    tracing::debug!("Disabled the console control events");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_child() -> libc::pid_t {
        let child = std::process::Command::new("true").spawn().unwrap();
        child.id() as libc::pid_t
    }

    #[test]
    fn test_acknowledged_child_is_the_worker() {
        let pid = spawn_child();
        let outcome = confirm_detach(pid, b"1").unwrap();
        assert_eq!(outcome, Detachment::Launcher { child_pid: pid as u32 });
        unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
    }

    #[test]
    fn test_silent_child_fails_the_detach() {
        let pid = spawn_child();
        let err = confirm_detach(pid, b"").unwrap_err();
        assert!(err.to_string().contains(&pid.to_string()), "{err}");
        // Already reaped by the failed confirmation.
        assert_eq!(unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) }, -1);
    }
}
