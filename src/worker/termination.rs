//! Escalating subprocess termination.
//!
//! `Requested` (graceful `terminate` message) → `SoftTerminated` (SIGTERM to
//! the process group) → `Killed` (SIGKILL). Every step waits at most the
//! term timeout for the process to exit before escalating.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tracing::{debug, warn};

use crate::error::RidLabel;
use crate::protocol::Action;

/// Escalation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Requested,
    SoftTerminated,
    Killed,
}

impl Termination {
    /// Next, more forceful step.
    pub fn escalate(self) -> Option<Self> {
        match self {
            Self::Requested => Some(Self::SoftTerminated),
            Self::SoftTerminated => Some(Self::Killed),
            Self::Killed => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Requested => "exited on request",
            Self::SoftTerminated => "terminated",
            Self::Killed => "killed",
        }
    }
}

/// Drive a child process to exit. Never fails; logs if the process survives
/// every step.
pub(crate) async fn terminate(
    child: &mut Child,
    mut stdin: Option<ChildStdin>,
    rid: RidLabel,
    send_timeout: Duration,
    term_timeout: Duration,
) {
    let mut step = Termination::Requested;
    loop {
        match step {
            Termination::Requested => {
                if let Some(stdin) = stdin.as_mut() {
                    if let Err(reason) = send_terminate(stdin, send_timeout).await {
                        debug!(rid = %rid, %reason, "failed to send terminate request");
                    }
                }
            }
            Termination::SoftTerminated => {
                // Closing stdin also unblocks workers waiting on a read.
                stdin = None;
                signal_group(child, rid, false);
            }
            Termination::Killed => {
                signal_group(child, rid, true);
                if let Err(e) = child.start_kill() {
                    debug!(rid = %rid, error = %e, "kill failed");
                }
            }
        }

        match tokio::time::timeout(term_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(rid = %rid, %status, "worker {}", step.describe());
                return;
            }
            Ok(Err(e)) => {
                debug!(rid = %rid, error = %e, "failed to wait for worker");
            }
            Err(_) => {
                debug!(rid = %rid, ?step, "worker still alive after {term_timeout:?}");
            }
        }

        match step.escalate() {
            Some(next) => step = next,
            None => {
                warn!(rid = %rid, "worker refuses to die");
                return;
            }
        }
    }
}

async fn send_terminate(stdin: &mut ChildStdin, send_timeout: Duration) -> Result<(), String> {
    let mut line = serde_json::to_string(&Action::Terminate).map_err(|e| e.to_string())?;
    line.push('\n');
    let write = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    };
    match tokio::time::timeout(send_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timeout".to_string()),
    }
}

/// SIGTERM (or SIGKILL) the worker's process group.
#[cfg(unix)]
fn signal_group(child: &Child, rid: RidLabel, kill: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
    // Workers are spawned as process group leaders.
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => debug!(rid = %rid, error = %e, "{signal} to process group failed"),
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _rid: RidLabel, _kill: bool) {}
