//! Per-application backup agents.
//!
//! Agents live outside the engine: each `on_backup` call is dispatched as its own task and
//! its completion is correlated back to the waiting run through a pending-operation token.

pub mod metadata;
pub mod session;

pub use metadata::MetadataAgent;
pub use session::{AgentOutput, AgentSession};

use crate::payload::{PayloadWriter, StateWriter};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait BackupAgent: Send + Sync + 'static {
    /// Write changed entities to `data` and the complete new state to `new_state`.
    /// `old_state` is empty for a non-incremental backup.
    async fn on_backup(
        &self,
        old_state: Bytes,
        data: &mut PayloadWriter,
        new_state: &mut StateWriter,
    ) -> anyhow::Result<()>;

    /// The transport refused the payload because it exceeded the quota.
    async fn on_quota_exceeded(&self, _backup_size: u64, _quota: u64) {}

    /// The engine discarded the agent's result; the agent must not treat it as committed.
    fn fail(&self, _reason: &str) {}
}

/// Resolves item identifiers to bound agents.
pub trait AgentResolver: Send + Sync {
    fn bind(&self, item: &str) -> Option<Arc<dyn BackupAgent>>;

    fn metadata_agent(&self) -> Arc<dyn BackupAgent>;

    /// Release whatever `bind` acquired.
    fn unbind(&self, _item: &str) {}
}

/// In-memory resolver over registered agents.
pub struct AgentRegistry {
    agents: DashMap<String, Arc<dyn BackupAgent>>,
    metadata: Arc<dyn BackupAgent>,
}

impl AgentRegistry {
    pub fn new(metadata: Arc<dyn BackupAgent>) -> Self {
        Self {
            agents: DashMap::new(),
            metadata,
        }
    }

    pub fn register(&self, item: impl Into<String>, agent: Arc<dyn BackupAgent>) {
        self.agents.insert(item.into(), agent);
    }

    pub fn unregister(&self, item: &str) {
        self.agents.remove(item);
    }

    pub fn is_registered(&self, item: &str) -> bool {
        self.agents.contains_key(item)
    }

    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl AgentResolver for AgentRegistry {
    fn bind(&self, item: &str) -> Option<Arc<dyn BackupAgent>> {
        self.agents.get(item).map(|a| Arc::clone(a.value()))
    }

    fn metadata_agent(&self) -> Arc<dyn BackupAgent> {
        Arc::clone(&self.metadata)
    }
}
