//! Shell spawning and process-group signalling.
//!
//! Children are spawned through the user shell in a fresh process group so a
//! whole shell-spawned subtree can be signalled as one unit. The supervisor
//! and the ephemeral runner share this discipline; only their escalation
//! timeouts differ.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

/// SIGTERM → SIGKILL escalation delay for supervised runnables.
pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// SIGTERM → SIGKILL escalation delay for ephemeral commands.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Signals the supervisor sends to child process groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// How a child exit should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Clean,
    /// Terminated by SIGTERM or SIGINT, the signals the supervisor sends.
    SupervisorSignal,
    /// Non-zero exit code.
    Code(i32),
    /// Terminated by any other signal.
    Signal(i32),
}

impl ExitKind {
    /// Human-readable message for the error channel; `None` for the kinds
    /// that classify as a clean stop.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ExitKind::Clean | ExitKind::SupervisorSignal => None,
            ExitKind::Code(code) => Some(format!("Exited with code {}", code)),
            ExitKind::Signal(signal) => Some(format!("Exited with signal {}", signal)),
        }
    }
}

/// Classifies a child's exit status.
pub fn classify_exit(status: &ExitStatus) -> ExitKind {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            if signal == libc::SIGTERM || signal == libc::SIGINT {
                return ExitKind::SupervisorSignal;
            }
            return ExitKind::Signal(signal);
        }
    }
    match status.code() {
        Some(0) => ExitKind::Clean,
        Some(code) => ExitKind::Code(code),
        // No code and no signal; treat like an interrupted run.
        None => ExitKind::SupervisorSignal,
    }
}

/// Spawns `command` via the user shell in a new process group.
///
/// `env` entries are applied in order, later entries winning, on top of the
/// inherited process environment. stdin is closed; stdout and stderr are
/// line pipes.
pub fn spawn_shell(
    command: &str,
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> std::io::Result<Child> {
    let mut cmd = shell_command(command);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    cmd.spawn()
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Sends a signal to the child's process group, falling back to the leader
/// pid when the group signal fails. Failures of both are logged; the caller
/// then waits for a natural exit.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        if libc::kill(-pid, sig) != 0 && libc::kill(pid, sig) != 0 {
            tracing::warn!(pid, "failed to signal process group or leader");
        }
    }
}

#[cfg(all(not(unix), windows))]
pub fn signal_group(pid: u32, signal: Signal) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // Windows has no SIGTERM; CTRL_BREAK is the closest console signal. The
    // escalation path relies on Child::kill for the hard stop.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
pub fn signal_group(_pid: u32, _signal: Signal) {}

/// Probes whether a pid is alive via the zero signal. EPERM means the pid
/// exists but belongs to another user, so it counts as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a cheap probe, report alive and let the owner clean up.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_runs_through_a_shell() {
        let mut child = spawn_shell("echo one && echo two", None, &[]).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(classify_exit(&status), ExitKind::Clean);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_later_entries_win() {
        let env = vec![
            ("DEVRACK_TEST".to_string(), "first".to_string()),
            ("DEVRACK_TEST".to_string(), "second".to_string()),
        ];
        let mut child = spawn_shell("test \"$DEVRACK_TEST\" = second", None, &env).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(classify_exit(&status), ExitKind::Clean);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_classifies_with_code() {
        let mut child = spawn_shell("exit 3", None, &[]).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(classify_exit(&status), ExitKind::Code(3));
        assert_eq!(
            ExitKind::Code(3).error_message().as_deref(),
            Some("Exited with code 3")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_classifies_as_supervisor_signal() {
        let mut child = spawn_shell("sleep 30", None, &[]).unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        signal_group(pid, Signal::Term);
        let status = child.wait().await.unwrap();
        assert_eq!(classify_exit(&status), ExitKind::SupervisorSignal);
        assert!(ExitKind::SupervisorSignal.error_message().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn pid_probe_detects_own_process() {
        assert!(pid_alive(std::process::id()));
    }
}
