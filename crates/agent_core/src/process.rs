use std::path::Path;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Puts the child into its own process group at spawn time on POSIX so a
/// later graceful kill can target the whole group, not just the immediate
/// child (which may itself have spawned grandchildren).
#[cfg(unix)]
fn prepare_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn prepare_process_group(_command: &mut Command) {}

/// Spawns `command`, retrying with capped exponential backoff when the
/// executable is transiently busy (`ETXTBSY`), which can happen when the
/// binary was just written to disk by a concurrent install.
pub fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, AgentError> {
    prepare_process_group(command);
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(AgentError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }
    unreachable!("spawn_with_retry should return before exhausting retries")
}

/// The single owner of a spawned child's handle for the duration of one
/// `Execute` call. Nothing else may signal or read from the
/// process once wrapped here.
pub struct ProcessGuard {
    child: Option<Child>,
}

impl ProcessGuard {
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    pub fn take(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Gracefully kills the child: on POSIX, signals the whole process
    /// group with `SIGTERM`, waits up to `grace`, then escalates to
    /// `SIGKILL` on the group if the child is still alive. Elsewhere, kills
    /// the direct handle. Clears the handle once the wait completes, per
    /// the ownership contract.
    pub async fn graceful_kill(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                kill_process_group(pid, false);
                match time::timeout(grace, child.wait()).await {
                    Ok(_) => return,
                    Err(_) => {
                        warn!(pid, "process group did not exit after SIGTERM, escalating");
                        kill_process_group(pid, true);
                    }
                }
            }
        }

        if let Err(error) = child.kill().await {
            debug!(?error, "child kill() failed, process likely already exited");
        }
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(error) = killpg(target, signal) {
        debug!(?error, pid, ?signal, "killpg failed");
    }
}
