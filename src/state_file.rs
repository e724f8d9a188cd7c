//! State export for external inspectors.
//!
//! The exporter subscribes to `status-change` and rewrites a JSON snapshot of
//! every service plus a tail of its combined logs. The file lives in a
//! per-user directory under a name derived deterministically from the project
//! root, so an inspector can find it knowing only that root. Output events do
//! not trigger writes; the logs section is refreshed from the log store on
//! each status change instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::Utc;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::logs::StreamKind;
use crate::runnable::RunnableStatus;
use crate::spawn::pid_alive;
use crate::supervisor::Supervisor;

/// Combined-log lines kept per service in the snapshot.
const SNAPSHOT_LOG_LINES: usize = 100;
/// Hex chars of the project-root digest used in the filename.
const HASH_LEN: usize = 12;

/// The exported document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// The supervisor's own pid; readers probe it to detect stale files.
    pub pid: u32,
    pub config_path: String,
    pub project_root: String,
    /// ISO-8601 timestamp of the write.
    pub updated_at: String,
    pub services: BTreeMap<String, ServiceEntry>,
    pub logs: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub status: RunnableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock epoch milliseconds of the last spawn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl StateSnapshot {
    /// A snapshot whose supervisor no longer runs is stale; readers delete
    /// such files themselves.
    pub fn is_stale(&self) -> bool {
        !pid_alive(self.pid)
    }
}

/// Default per-user directory for state files.
pub fn state_dir() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(std::env::temp_dir)
        .join("devrack")
        .join("state")
}

/// First 12 hex chars of the SHA-256 of the project root path. Stable per
/// root, which is what lets external readers locate the file.
pub fn project_hash(project_root: &Path) -> String {
    let digest = Sha256::digest(project_root.to_string_lossy().as_bytes());
    hex::encode(digest)[..HASH_LEN].to_string()
}

/// The deterministic state-file path for a project root.
pub fn state_file_path(project_root: &Path) -> PathBuf {
    state_dir().join(format!("{}.json", project_hash(project_root)))
}

/// Reads and parses a state file.
pub fn read_snapshot(path: &Path) -> Result<StateSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse state file {}", path.display()))
}

/// Removes the file when it belongs to a supervisor that no longer runs.
pub fn cleanup_if_stale(path: &Path) {
    let Ok(snapshot) = read_snapshot(path) else { return };
    if snapshot.is_stale() {
        let _ = std::fs::remove_file(path);
    }
}

/// Writes snapshots of the supervisor's state on every status change and
/// deletes the file at shutdown.
pub struct StateExporter {
    path: PathBuf,
}

impl StateExporter {
    /// Attaches at the default per-user location for `project_root`.
    pub fn attach(supervisor: &Supervisor, config_path: &Path, project_root: &Path) -> Self {
        Self::attach_at(
            supervisor,
            state_file_path(project_root),
            config_path,
            project_root,
        )
    }

    /// Attaches with an explicit file path.
    pub fn attach_at(
        supervisor: &Supervisor,
        path: PathBuf,
        config_path: &Path,
        project_root: &Path,
    ) -> Self {
        cleanup_if_stale(&path);

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        supervisor.bus().on_status_change(move |_| {
            let _ = tx.send(());
        });

        let supervisor = supervisor.clone();
        let write_path = path.clone();
        let config_path = config_path.display().to_string();
        let project_root = project_root.display().to_string();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Coalesce bursts of transitions into one write.
                while rx.try_recv().is_ok() {}
                if let Err(err) =
                    write_snapshot(&supervisor, &write_path, &config_path, &project_root)
                {
                    tracing::warn!(error = %err, "failed to write state file");
                }
            }
        });

        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the state file; call when supervision ends.
    pub fn shutdown(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_snapshot(
    supervisor: &Supervisor,
    path: &Path,
    config_path: &str,
    project_root: &str,
) -> Result<()> {
    let mut services = BTreeMap::new();
    let mut logs = BTreeMap::new();
    for state in supervisor.get_all() {
        let started_at = state.started_at.and_then(|at| {
            at.duration_since(UNIX_EPOCH)
                .ok()
                .map(|elapsed| elapsed.as_millis() as u64)
        });
        services.insert(
            state.id.clone(),
            ServiceEntry {
                status: state.status,
                error: state.error.clone(),
                started_at,
            },
        );
        logs.insert(
            state.id.clone(),
            supervisor.get_output_lines(&state.id, StreamKind::Combined, Some(SNAPSHOT_LOG_LINES)),
        );
    }
    let snapshot = StateSnapshot {
        pid: std::process::id(),
        config_path: config_path.to_string(),
        project_root: project_root.to_string(),
        updated_at: Utc::now().to_rfc3339(),
        services,
        logs,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
