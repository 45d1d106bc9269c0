//! Small process-related helpers shared across the workspace.
//!
//! Children spawned through [`tokio_command`] lead their own process group on
//! unix, so a termination signal reaches every process the child forks (shell
//! wrappers, encoder helpers) and not only the direct child.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` suitable for supervised children.
///
/// The command gets no console window on Windows, becomes a process-group
/// leader on unix and is killed if its handle is dropped.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.kill_on_drop(true);
    cmd
}

/// Which signal to deliver to a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ask the process to exit (SIGTERM on unix).
    Graceful,
    /// Kill the process immediately (SIGKILL on unix).
    Forced,
}

/// Send a termination signal to `pid` and its process group.
///
/// A process that already exited is not an error.
#[cfg(unix)]
pub fn signal_process(pid: u32, termination: Termination) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    let pid = Pid::from_raw(pid as i32);

    match killpg(pid, signal) {
        Ok(()) => Ok(()),
        // Not a group leader: fall back to the single process.
        Err(Errno::ESRCH) | Err(Errno::EPERM) => match kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

/// Send a termination signal to `pid`.
///
/// Without POSIX signals there is no graceful variant; callers fall back to
/// killing the child handle directly.
#[cfg(not(unix))]
pub fn signal_process(_pid: u32, _termination: Termination) -> std::io::Result<()> {
    Ok(())
}

/// Terminate a child: graceful signal, wait up to `grace`, then force-kill.
///
/// Returns the exit status the child finally reported.
#[cfg(feature = "tokio")]
pub async fn terminate_gracefully(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    match child.id() {
        Some(pid) if cfg!(unix) => signal_process(pid, Termination::Graceful)?,
        _ => child.start_kill()?,
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            if let Some(pid) = child.id() {
                signal_process(pid, Termination::Forced)?;
            }
            child.kill().await?;
            child.wait().await
        }
    }
}
