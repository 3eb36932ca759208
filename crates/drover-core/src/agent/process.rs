//! Child process handling for the agent.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::registry::Invocation;

/// Start a task with piped stdout/stderr in its own process group, so
/// shell grandchildren can be signalled together. The child dies with the agent.
pub fn spawn(invocation: &Invocation, working_dir: &Path) -> std::io::Result<Child> {
    Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
}

fn signal_group(pgid: i32, sig: Signal) {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => debug!(pgid, signal = ?sig, "signalled process group"),
        // group already empty
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid, signal = ?sig, error = %e, "killpg failed"),
    }
}

/// SIGTERM to the task's process group, wait up to `grace`, then SIGKILL.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    // the leader's pid is the group id; None once the child was reaped
    let pgid = child.id().map(|pid| pid as i32);
    if let Some(pgid) = pgid {
        signal_group(pgid, Signal::SIGTERM);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            if let Some(pgid) = pgid {
                // stragglers that ignored SIGTERM would keep the capture pipes open
                signal_group(pgid, Signal::SIGKILL);
            }
            status
        }
        Err(_) => {
            warn!(?pgid, ?grace, "task ignored SIGTERM, killing");
            if let Some(pgid) = pgid {
                signal_group(pgid, Signal::SIGKILL);
            }
            child.kill().await?;
            child.wait().await
        }
    }
}
