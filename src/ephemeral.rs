//! Ephemeral command execution.
//!
//! One-shot commands launched ad-hoc share the supervisor's shell and
//! process-group discipline but never touch the scheduler. A `CommandRunner`
//! streams output to a swappable listener, which is how a foreground command
//! is "minimized": the owning UI detaches, a `BackgroundCommands` collection
//! attaches its own listener, and the process never notices.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::logs::{RingBuffer, StreamKind};
use crate::spawn::{self, Signal};

/// Lifecycle of an ephemeral command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Idle,
    Running,
    Success,
    Error,
}

/// Events streamed to the active listener.
#[derive(Debug, Clone)]
pub enum CommandEvent {
    Output { line: String, stream: StreamKind },
    Exit { code: Option<i32>, signal: Option<i32> },
}

/// Listener receiving command events; swapped atomically on hand-off.
pub type CommandListener = Box<dyn Fn(&CommandEvent) + Send + Sync>;

/// Point-in-time view of a runner.
#[derive(Debug, Clone)]
pub struct CommandSnapshot {
    pub command: String,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<SystemTime>,
    pub duration: Option<Duration>,
    pub output: Vec<String>,
}

struct RunnerState {
    command: String,
    status: CommandStatus,
    exit_code: Option<i32>,
    started_at: Option<SystemTime>,
    duration: Option<Duration>,
    output: RingBuffer,
    pid: Option<u32>,
    /// Bumped per run; tasks from an older run drop their results.
    generation: u64,
    exited_tx: Option<watch::Sender<bool>>,
}

struct RunnerInner {
    state: Mutex<RunnerState>,
    listener: Mutex<Option<CommandListener>>,
    max_lines: usize,
}

/// Runs one command at a time, streaming output and allowing cancellation.
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<RunnerInner>,
}

impl CommandRunner {
    /// Creates an idle runner whose output is capped at `max_lines`.
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                state: Mutex::new(RunnerState {
                    command: String::new(),
                    status: CommandStatus::Idle,
                    exit_code: None,
                    started_at: None,
                    duration: None,
                    output: RingBuffer::new(max_lines),
                    pid: None,
                    generation: 0,
                    exited_tx: None,
                }),
                listener: Mutex::new(None),
                max_lines,
            }),
        }
    }

    pub fn max_lines(&self) -> usize {
        self.inner.max_lines
    }

    /// Spawns `command` under the shared shell + process-group discipline,
    /// cancelling any command still running. Returns once the child is
    /// spawned; completion arrives as an `Exit` event.
    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<()> {
        self.cancel().await;

        let mut full_env = env.to_vec();
        full_env.push(("FORCE_COLOR".to_string(), "1".to_string()));
        let child = spawn::spawn_shell(command, cwd, &full_env);
        let started = Instant::now();
        let (exited_tx, _) = watch::channel(false);

        let generation = {
            let mut state = self.inner.state.lock().unwrap();
            state.generation += 1;
            state.command = command.to_string();
            state.output.clear();
            state.exit_code = None;
            state.started_at = Some(SystemTime::now());
            state.duration = None;
            state.exited_tx = Some(exited_tx.clone());
            state.status = if child.is_ok() {
                CommandStatus::Running
            } else {
                CommandStatus::Error
            };
            state.pid = None;
            state.generation
        };

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                self.notify(&CommandEvent::Exit {
                    code: None,
                    signal: None,
                });
                let _ = exited_tx.send(true);
                return Err(err).with_context(|| format!("failed to spawn {}", command));
            }
        };
        self.inner.state.lock().unwrap().pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::read_stream(
                self.clone(),
                generation,
                StreamKind::Stdout,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::read_stream(
                self.clone(),
                generation,
                StreamKind::Stderr,
                stderr,
            ));
        }

        let runner = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let event = {
                let mut state = runner.inner.state.lock().unwrap();
                if state.generation != generation {
                    return;
                }
                state.pid = None;
                state.duration = Some(started.elapsed());
                match &status {
                    Ok(status) => {
                        state.exit_code = status.code();
                        state.status = if status.code() == Some(0) {
                            CommandStatus::Success
                        } else {
                            CommandStatus::Error
                        };
                        CommandEvent::Exit {
                            code: status.code(),
                            signal: exit_signal(status),
                        }
                    }
                    Err(_) => {
                        state.status = CommandStatus::Error;
                        CommandEvent::Exit {
                            code: None,
                            signal: None,
                        }
                    }
                }
            };
            // Listener first: a cancel waiting on the exit flag must observe
            // the final event once it resumes.
            runner.notify(&event);
            let _ = exited_tx.send(true);
        });
        Ok(())
    }

    async fn read_stream<R>(runner: CommandRunner, generation: u64, stream: StreamKind, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            {
                let mut state = runner.inner.state.lock().unwrap();
                if state.generation != generation {
                    return;
                }
                state.output.push(line.clone());
            }
            runner.notify(&CommandEvent::Output { line, stream });
        }
    }

    /// Terminates the running command: SIGTERM to its group, SIGKILL after
    /// 2 s. Safe to call repeatedly and while idle; resolves on exit.
    pub async fn cancel(&self) {
        let (pid, rx) = {
            let state = self.inner.state.lock().unwrap();
            if state.status != CommandStatus::Running {
                return;
            }
            (state.pid, state.exited_tx.as_ref().map(|tx| tx.subscribe()))
        };
        let Some(mut rx) = rx else { return };
        if let Some(pid) = pid {
            spawn::signal_group(pid, Signal::Term);
        }
        if tokio::time::timeout(spawn::CANCEL_GRACE, wait_exited(&mut rx))
            .await
            .is_err()
        {
            if let Some(pid) = pid {
                spawn::signal_group(pid, Signal::Kill);
            }
            wait_exited(&mut rx).await;
        }
    }

    /// Cancels anything running, clears the output buffer and returns the
    /// runner to `idle` for reuse.
    pub async fn reset(&self) {
        self.cancel().await;
        let mut state = self.inner.state.lock().unwrap();
        state.command.clear();
        state.status = CommandStatus::Idle;
        state.exit_code = None;
        state.started_at = None;
        state.duration = None;
        state.output.clear();
        state.exited_tx = None;
    }

    /// Installs the listener, replacing any previous one. The swap does not
    /// disturb the running process.
    pub fn set_listener(&self, listener: CommandListener) {
        *self.inner.listener.lock().unwrap() = Some(listener);
    }

    /// Detaches the current listener.
    pub fn clear_listener(&self) {
        *self.inner.listener.lock().unwrap() = None;
    }

    pub fn status(&self) -> CommandStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn snapshot(&self) -> CommandSnapshot {
        let state = self.inner.state.lock().unwrap();
        CommandSnapshot {
            command: state.command.clone(),
            status: state.status,
            exit_code: state.exit_code,
            started_at: state.started_at,
            duration: state.duration,
            output: state.output.to_vec(),
        }
    }

    fn notify(&self, event: &CommandEvent) {
        let listener = self.inner.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener(event);
        }
    }
}

async fn wait_exited(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Mirror of a minimized command maintained by its background listener.
#[derive(Debug)]
pub struct BackgroundState {
    pub output: RingBuffer,
    pub finished: bool,
    pub exit_code: Option<i32>,
}

/// Queryable view of a background entry.
#[derive(Debug, Clone)]
pub struct BackgroundSnapshot {
    pub id: u64,
    pub command: String,
    pub finished: bool,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
}

struct BackgroundEntry {
    command: String,
    runner: CommandRunner,
    state: Arc<Mutex<BackgroundState>>,
}

/// Background collection for minimized commands. Holds its own cancellation
/// handle per entry; adopting is a listener swap, the process keeps running.
#[derive(Default)]
pub struct BackgroundCommands {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, BackgroundEntry>>,
}

impl BackgroundCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes over a runner under a fresh id. The previous listener is
    /// replaced by one that mutates this entry's state.
    pub fn adopt(&self, runner: &CommandRunner) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = runner.snapshot();
        let mut output = RingBuffer::new(runner.max_lines());
        for line in &snapshot.output {
            output.push(line.clone());
        }
        let state = Arc::new(Mutex::new(BackgroundState {
            output,
            finished: matches!(
                snapshot.status,
                CommandStatus::Success | CommandStatus::Error
            ),
            exit_code: snapshot.exit_code,
        }));

        let sink = state.clone();
        runner.set_listener(Box::new(move |event| {
            let mut state = sink.lock().unwrap();
            match event {
                CommandEvent::Output { line, .. } => state.output.push(line.clone()),
                CommandEvent::Exit { code, .. } => {
                    state.finished = true;
                    state.exit_code = *code;
                }
            }
        }));

        self.entries.lock().unwrap().insert(
            id,
            BackgroundEntry {
                command: snapshot.command,
                runner: runner.clone(),
                state,
            },
        );
        id
    }

    /// Cancels the entry's command via its own handle.
    pub async fn cancel(&self, id: u64) {
        let runner = {
            let entries = self.entries.lock().unwrap();
            entries.get(&id).map(|entry| entry.runner.clone())
        };
        if let Some(runner) = runner {
            runner.cancel().await;
        }
    }

    /// Drops an entry; returns whether it existed.
    pub fn remove(&self, id: u64) -> bool {
        self.entries.lock().unwrap().remove(&id).is_some()
    }

    pub fn get(&self, id: u64) -> Option<BackgroundSnapshot> {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).map(|entry| {
            let state = entry.state.lock().unwrap();
            BackgroundSnapshot {
                id,
                command: entry.command.clone(),
                finished: state.finished,
                exit_code: state.exit_code,
                output: state.output.to_vec(),
            }
        })
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn wait_for_status(runner: &CommandRunner, status: CommandStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while runner.status() != status {
            if tokio::time::Instant::now() >= deadline {
                panic!("runner never reached {:?} ({:?})", status, runner.status());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // The exit event can land before the pipe readers drain their last
    // lines, so output assertions poll.
    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_output_and_classifies_success() {
        let runner = CommandRunner::new(1000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        runner.set_listener(Box::new(move |event| {
            let _ = tx.send(event.clone());
        }));
        runner.run("echo out && echo err >&2", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Success).await;
        wait_until("both lines", || runner.snapshot().output.len() == 2).await;

        let snapshot = runner.snapshot();
        assert_eq!(snapshot.exit_code, Some(0));
        assert!(snapshot.duration.is_some());
        assert!(snapshot.output.contains(&"out".to_string()));
        assert!(snapshot.output.contains(&"err".to_string()));

        let mut saw_exit = false;
        while let Ok(event) = rx.try_recv() {
            if let CommandEvent::Exit { code, .. } = event {
                assert_eq!(code, Some(0));
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let runner = CommandRunner::new(1000);
        runner.run("exit 7", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Error).await;
        assert_eq!(runner.snapshot().exit_code, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_is_safe_when_idle_and_repeatable() {
        let runner = CommandRunner::new(1000);
        runner.cancel().await;
        runner.run("sleep 30", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Running).await;
        runner.cancel().await;
        assert_eq!(runner.status(), CommandStatus::Error);
        runner.cancel().await;
        assert_eq!(runner.status(), CommandStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_while_running_cancels_the_previous_command() {
        let runner = CommandRunner::new(1000);
        runner.run("sleep 30", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Running).await;
        runner.run("echo hi", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Success).await;
        wait_until("replacement output", || runner.snapshot().output == vec!["hi"]).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reset_returns_to_idle() {
        let runner = CommandRunner::new(1000);
        runner.run("echo hi", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Success).await;
        runner.reset().await;
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.status, CommandStatus::Idle);
        assert!(snapshot.output.is_empty());
        assert!(snapshot.exit_code.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_capped() {
        let runner = CommandRunner::new(10);
        runner
            .run("i=0; while [ $i -lt 100 ]; do echo line$i; i=$((i+1)); done", None, &[])
            .await
            .unwrap();
        wait_for_status(&runner, CommandStatus::Success).await;
        wait_until("drained output", || {
            runner.snapshot().output.last().map(String::as_str) == Some("line99")
        })
        .await;
        assert_eq!(runner.snapshot().output.len(), 10);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn minimize_swaps_listeners_without_disturbing_the_process() {
        let runner = CommandRunner::new(1000);
        let (tx, mut foreground) = mpsc::unbounded_channel();
        runner.set_listener(Box::new(move |event| {
            let _ = tx.send(event.clone());
        }));
        runner
            .run(
                "echo first; sleep 1; echo second; echo third",
                None,
                &[],
            )
            .await
            .unwrap();
        // Let the first line land on the foreground listener.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let background = BackgroundCommands::new();
        let id = background.adopt(&runner);

        wait_until("background completion", || {
            let entry = background.get(id).unwrap();
            entry.finished && entry.output.len() == 3
        })
        .await;

        let entry = background.get(id).unwrap();
        assert_eq!(entry.exit_code, Some(0));
        assert_eq!(
            entry.output,
            vec!["first", "second", "third"],
            "adoption seeds prior output and the new listener appends"
        );
        // The foreground listener saw the pre-handoff stream only.
        let mut foreground_lines = Vec::new();
        while let Ok(event) = foreground.try_recv() {
            if let CommandEvent::Output { line, .. } = event {
                foreground_lines.push(line);
            }
        }
        assert_eq!(foreground_lines, vec!["first"]);
        assert!(background.remove(id));
        assert!(background.get(id).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_collection_can_cancel() {
        let runner = CommandRunner::new(1000);
        runner.run("sleep 30", None, &[]).await.unwrap();
        wait_for_status(&runner, CommandStatus::Running).await;
        let background = BackgroundCommands::new();
        let id = background.adopt(&runner);
        background.cancel(id).await;
        let entry = background.get(id).unwrap();
        assert!(entry.finished);
        assert_ne!(entry.exit_code, Some(0));
    }
}
