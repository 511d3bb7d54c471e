//! Agents available to the runner.

pub mod directory;

pub use directory::DirectoryAgent;

use crate::config::RunnerConfig;
use backup_engine::{AgentRegistry, MetadataAgent};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One directory agent per configured application. The metadata agent records each
/// application's data directory as its descriptor.
pub fn build_registry(config: &RunnerConfig) -> AgentRegistry {
    let descriptors: BTreeMap<String, String> = config
        .apps
        .iter()
        .map(|(id, dir)| (id.clone(), dir.display().to_string()))
        .collect();
    let registry = AgentRegistry::new(Arc::new(MetadataAgent::new(descriptors)));

    for (id, dir) in &config.apps {
        registry.register(
            id.clone(),
            Arc::new(DirectoryAgent::new(id.clone(), dir.clone(), config.exclude.clone())),
        );
    }
    registry
}
