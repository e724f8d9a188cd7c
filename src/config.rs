//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration
//! file, loads it, and resolves each declared runnable into an immutable
//! `RunnableSpec`. Container declarations are synthesized into a `docker run`
//! command line once, at resolution time.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::runnable::{RunnableKind, RunnableSpec};

/// Per-stream log buffer capacity unless overridden in `[defaults]`.
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 1000;
/// Readiness grace period for runnables without a `ready_when` pattern.
pub const DEFAULT_GRACE_MS: u64 = 500;

/// A definition-level configuration problem. These are fatal: they are
/// reported before any child process is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown runnable {id}")]
    UnknownRunnable { id: String },
    #[error("runnable {id}: command must not be empty")]
    EmptyCommand { id: String },
    #[error("runnable {id}: container runnables require an image")]
    MissingImage { id: String },
    #[error("runnable {id}: invalid ready_when pattern: {source}")]
    InvalidReadyPattern { id: String, source: regex::Error },
    #[error("runnable {id} depends on unknown runnable {dep} (known runnables: {})", known.join(", "))]
    MissingDependency {
        id: String,
        dep: String,
        known: Vec<String>,
    },
    #[error("Dependency cycle detected: {}", ids.join(", "))]
    DependencyCycle { ids: Vec<String> },
}

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Runnable definitions keyed by id.
    #[serde(default)]
    pub runnables: BTreeMap<String, RunnableConfig>,
    /// Named ordered lists of runnable ids.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Defaults applied to every runnable.
    #[serde(default)]
    pub defaults: Defaults,
    /// Command-name prefixes surfaced by UI layers; not used by the core.
    #[serde(default)]
    pub shell_commands: Vec<String>,
    /// Script-source producers surfaced by UI layers; not used by the core.
    #[serde(default)]
    pub scripts: Vec<ScriptSource>,
}

/// The `[defaults]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    /// Environment applied to every runnable, under its own env.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-stream log buffer capacity.
    pub max_output_lines: Option<usize>,
    /// Grace period override in milliseconds.
    pub grace_ms: Option<u64>,
}

/// Configuration for a single runnable.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnableConfig {
    /// Display label; defaults to the id.
    pub name: Option<String>,
    #[serde(default)]
    pub kind: KindConfig,
    /// Shell command line (required for `kind = "shell"`).
    pub command: Option<String>,
    /// Container image (required for `kind = "container"`).
    pub image: Option<String>,
    /// Container port mappings, `host:container`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Container volume mappings.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Definition environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Ids that must be running before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Regex matched against the ANSI-stripped combined output.
    pub ready_when: Option<String>,
    /// Grace period override in milliseconds.
    pub grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindConfig {
    #[default]
    Shell,
    Container,
}

/// A script-source entry consumed by UI layers.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSource {
    /// Producer kind, e.g. `package-json`.
    pub source: String,
    /// Path the producer reads, relative to the project root.
    pub path: Option<String>,
}

impl Config {
    /// Per-stream log buffer capacity for this config.
    pub fn max_output_lines(&self) -> usize {
        self.defaults
            .max_output_lines
            .unwrap_or(DEFAULT_MAX_OUTPUT_LINES)
    }

    /// Resolves every declared runnable into its immutable spec.
    pub fn specs(&self) -> Result<BTreeMap<String, RunnableSpec>, ConfigError> {
        let mut specs = BTreeMap::new();
        for (id, runnable) in &self.runnables {
            specs.insert(id.clone(), runnable.resolve(id, &self.defaults)?);
        }
        Ok(specs)
    }
}

impl RunnableConfig {
    fn resolve(&self, id: &str, defaults: &Defaults) -> Result<RunnableSpec, ConfigError> {
        let (kind, command) = match self.kind {
            KindConfig::Shell => {
                let command = self.command.clone().unwrap_or_default();
                if command.trim().is_empty() {
                    return Err(ConfigError::EmptyCommand { id: id.to_string() });
                }
                (RunnableKind::Shell, command)
            }
            KindConfig::Container => {
                let image = self
                    .image
                    .as_deref()
                    .filter(|image| !image.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingImage { id: id.to_string() })?;
                (
                    RunnableKind::Container,
                    container_command(id, image, &self.ports, &self.volumes, &self.env),
                )
            }
        };

        let ready_when = match &self.ready_when {
            Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
                ConfigError::InvalidReadyPattern {
                    id: id.to_string(),
                    source,
                }
            })?),
            None => None,
        };

        let grace_ms = self
            .grace_ms
            .or(defaults.grace_ms)
            .unwrap_or(DEFAULT_GRACE_MS);

        Ok(RunnableSpec {
            id: id.to_string(),
            name: self.name.clone().unwrap_or_else(|| id.to_string()),
            kind,
            command,
            cwd: self.cwd.as_ref().map(PathBuf::from),
            env: self.env.clone(),
            depends_on: self.depends_on.clone(),
            ready_when,
            grace: Duration::from_millis(grace_ms),
        })
    }
}

// `docker run` synthesis for container runnables. Env flags are emitted in
// sorted key order so the command line is stable across runs.
fn container_command(
    id: &str,
    image: &str,
    ports: &[String],
    volumes: &[String],
    env: &HashMap<String, String>,
) -> String {
    let mut parts: Vec<String> = vec![
        "docker".into(),
        "run".into(),
        "--rm".into(),
        "--name".into(),
        format!("devrack-{}", id),
    ];
    for port in ports {
        parts.push("-p".into());
        parts.push(port.clone());
    }
    for volume in volumes {
        parts.push("-v".into());
        parts.push(volume.clone());
    }
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        parts.push("-e".into());
        parts.push(format!("{}={}", key, env[key]));
    }
    parts.push(image.to_string());
    shell_words::join(parts)
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runnables_groups_and_defaults() {
        let raw = r#"
shell_commands = ["npm", "cargo"]

[defaults]
max_output_lines = 200
grace_ms = 250
[defaults.env]
LOG_LEVEL = "debug"

[runnables.api]
command = "cargo run"
cwd = "api"
depends_on = ["db"]
ready_when = "listening on"
[runnables.api.env]
PORT = "3000"

[runnables.db]
kind = "container"
image = "postgres:16"
ports = ["5432:5432"]

[groups]
backend = ["db", "api"]

[[scripts]]
source = "package-json"
path = "web/package.json"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.max_output_lines(), 200);
        assert_eq!(config.groups["backend"], vec!["db", "api"]);
        assert_eq!(config.shell_commands, vec!["npm", "cargo"]);
        assert_eq!(config.scripts[0].source, "package-json");

        let specs = config.specs().unwrap();
        let api = &specs["api"];
        assert_eq!(api.name, "api");
        assert_eq!(api.command, "cargo run");
        assert_eq!(api.depends_on, vec!["db"]);
        assert!(api.ready_when.as_ref().unwrap().is_match("listening on 3000"));
        assert_eq!(api.grace, Duration::from_millis(250));
    }

    #[test]
    fn container_command_is_synthesized_and_quoted() {
        let raw = r#"
[runnables.db]
kind = "container"
image = "postgres:16"
ports = ["5432:5432"]
volumes = ["/var/my data:/data"]
[runnables.db.env]
POSTGRES_PASSWORD = "dev"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let specs = config.specs().unwrap();
        let db = &specs["db"];
        assert_eq!(db.kind, RunnableKind::Container);
        assert_eq!(
            db.command,
            "docker run --rm --name devrack-db -p 5432:5432 \
             -v '/var/my data:/data' -e POSTGRES_PASSWORD=dev postgres:16"
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let raw = r#"
[runnables.api]
command = "  "
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let err = config.specs().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand { ref id } if id == "api"));
    }

    #[test]
    fn container_without_image_is_rejected() {
        let raw = r#"
[runnables.db]
kind = "container"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(
            config.specs().unwrap_err(),
            ConfigError::MissingImage { .. }
        ));
    }

    #[test]
    fn invalid_ready_pattern_is_rejected() {
        let raw = r#"
[runnables.api]
command = "cargo run"
ready_when = "("
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(
            config.specs().unwrap_err(),
            ConfigError::InvalidReadyPattern { .. }
        ));
    }

    #[test]
    fn grace_defaults_to_500ms() {
        let raw = r#"
[runnables.api]
command = "cargo run"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let specs = config.specs().unwrap();
        assert_eq!(specs["api"].grace, Duration::from_millis(DEFAULT_GRACE_MS));
    }
}
