//! Data structures for tracking runnable state.
//!
//! A `RunnableSpec` is the immutable definition resolved from configuration.
//! `RunnableState` is the snapshot the supervisor hands to callers; live log
//! data is queried from the `LogStore`, never read off the snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a runnable is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnableKind {
    /// A shell command line.
    Shell,
    /// A container invocation; the command is synthesized at config load.
    Container,
}

/// Specification for a runnable, immutable once resolved from config.
#[derive(Debug, Clone)]
pub struct RunnableSpec {
    /// Stable string key.
    pub id: String,
    /// Display label; defaults to the id.
    pub name: String,
    pub kind: RunnableKind,
    /// Shell command line, run via `sh -c`.
    pub command: String,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Definition environment, applied over the config defaults.
    pub env: HashMap<String, String>,
    /// Ids that must reach `running` before this one starts.
    pub depends_on: Vec<String>,
    /// Readiness predicate over the ANSI-stripped combined output.
    pub ready_when: Option<Regex>,
    /// Grace period before `running` when no predicate is set.
    pub grace: Duration,
}

/// The lifecycle status of a runnable instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnableStatus {
    /// Not running; initial state, or exited cleanly.
    Stopped,
    /// Requested to start, gated on dependencies.
    Waiting,
    /// Process spawned, readiness not yet established.
    Starting,
    /// Ready and serving.
    Running,
    /// Spawn failure or unexpected exit.
    Error,
}

impl RunnableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnableStatus::Stopped => "stopped",
            RunnableStatus::Waiting => "waiting",
            RunnableStatus::Starting => "starting",
            RunnableStatus::Running => "running",
            RunnableStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunnableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a runnable instance.
#[derive(Debug, Clone)]
pub struct RunnableState {
    pub id: String,
    pub name: String,
    pub status: RunnableStatus,
    /// True until the runnable is first started after init.
    pub hidden: bool,
    pub pid: Option<u32>,
    /// Wall clock of the most recent spawn.
    pub started_at: Option<SystemTime>,
    /// Present iff `status == Error`.
    pub error: Option<String>,
    /// Dependencies not yet `running` when the instance gated; present iff
    /// `status == Waiting`, retained across dependency failures.
    pub waiting_for: Vec<String>,
}

/// Future returned by an `on_ready` hook.
pub type ReadyFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Hook invoked once per start epoch, just before `running` is emitted.
pub type OnReadyHook = Arc<dyn Fn(ReadyContext) -> ReadyFuture + Send + Sync>;

/// Arguments handed to an `on_ready` hook.
pub struct ReadyContext {
    /// ANSI-stripped snapshot of the combined output (last 500 lines).
    pub output: String,
    /// Sink for runtime env entries inherited by dependents.
    pub env: EnvWriter,
}

/// Collects runtime env entries written by an `on_ready` hook.
///
/// Writes are synchronous; the supervisor drains the entries before the
/// `running` transition is published, so dependents spawned afterwards
/// always observe them.
#[derive(Clone, Default)]
pub struct EnvWriter {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl EnvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an env entry; later writes to the same key win.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().unwrap().push((key.into(), value.into()));
    }

    /// Takes every recorded entry in write order.
    pub fn drain(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }
}
