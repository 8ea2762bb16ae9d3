use crate::errors::{AppError, AppResult};
use std::sync::Arc;

/// Forceful teardown of a helper together with everything it spawned.
pub trait ProcessTreeKiller: Send + Sync {
    /// Kills `pid` and its descendants. Blocking; call off the async runtime.
    fn kill_tree(&self, pid: u32) -> AppResult<()>;
    /// Whether anything from the tree rooted at `pid` is still observable.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Prepares a helper command so that [`ProcessTreeKiller::kill_tree`] can
/// reach every process it starts.
pub fn isolate_process_tree(command: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
}

pub fn platform_killer() -> Arc<dyn ProcessTreeKiller> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupKiller)
    }

    #[cfg(windows)]
    {
        Arc::new(TaskkillTreeKiller::default())
    }
}

/// The helper leads its own process group, so one signal reaches the tree.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupKiller;

#[cfg(unix)]
impl ProcessTreeKiller for ProcessGroupKiller {
    fn kill_tree(&self, pid: u32) -> AppResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};

        match killpg(group_of(pid)?, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(error) => Err(AppError::Io(format!(
                "failed to kill process group {}: {}",
                pid, error
            ))),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::killpg;

        match group_of(pid) {
            Ok(group) => killpg(group, None).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
fn group_of(pid: u32) -> AppResult<nix::unistd::Pid> {
    let raw = i32::try_from(pid).map_err(|_| AppError::Internal(format!("pid {} out of range", pid)))?;
    Ok(nix::unistd::Pid::from_raw(raw))
}

/// No process groups to signal here; `taskkill /T` walks the tree instead.
#[cfg(windows)]
#[derive(Debug, Clone, Copy)]
pub struct TaskkillTreeKiller {
    timeout: std::time::Duration,
}

#[cfg(windows)]
impl Default for TaskkillTreeKiller {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(3),
        }
    }
}

#[cfg(windows)]
impl ProcessTreeKiller for TaskkillTreeKiller {
    fn kill_tree(&self, pid: u32) -> AppResult<()> {
        use std::os::windows::process::CommandExt;
        use std::process::{Command, Stdio};
        use wait_timeout::ChildExt;

        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        let mut child = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .spawn()?;

        match child.wait_timeout(self.timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(AppError::Io(format!(
                "taskkill for pid {} exited with {}",
                pid, status
            ))),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(AppError::Timeout(format!("taskkill for pid {} did not finish", pid)))
            }
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        use std::os::windows::process::CommandExt;
        use std::process::Command;

        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        let needle = pid.to_string();
        match Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .any(|token| token == needle),
            Err(_) => false,
        }
    }
}
