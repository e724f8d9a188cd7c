//! devrack: a dependency-aware supervisor for local dev processes.
//!
//! The crate is consumed two ways: the `devrack` binary supervises the
//! runnables declared in `devrack.toml`, and UI layers embed the
//! [`supervisor::Supervisor`] directly, subscribing to its
//! [`events::EventBus`] and querying the [`logs::LogStore`] for live output.
//! One-shot commands run through [`ephemeral::CommandRunner`], and
//! [`state_file::StateExporter`] materializes supervisor state for external
//! inspectors.

pub mod config;
pub mod ephemeral;
pub mod events;
pub mod logs;
pub mod runnable;
pub mod spawn;
pub mod state_file;
pub mod supervisor;
pub mod targets;
