//! Backup Engine Library
//!
//! Drives key/value backup runs: a queue of items is handed one at a time to per-application
//! agents, their payloads are submitted to a transport and the new state is committed locally.

pub mod agent;
pub mod config;
pub mod engine;
pub mod item;
pub mod journal;
pub mod ops;
pub mod outcome;
pub mod payload;
pub mod reporter;
pub mod resources;
pub mod store;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use agent::{AgentRegistry, AgentResolver, BackupAgent, MetadataAgent};
pub use config::Config;
pub use engine::{BackupRunEngine, BackupTask, RunRequest};
pub use item::METADATA_SENTINEL;
pub use outcome::{ItemOutcome, RunResult, RunStatus};
pub use reporter::{BackupObserver, CompletionListener};
pub use transport::Transport;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
