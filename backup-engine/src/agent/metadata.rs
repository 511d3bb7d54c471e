//! Agent for the metadata sentinel item.
//!
//! Records one descriptor per known application plus a global `@meta@` entry. Its state is
//! the serialized descriptor map, so an incremental run only emits changed descriptors and
//! deletion markers for applications that disappeared.

use super::BackupAgent;
use crate::payload::{PayloadWriter, StateWriter};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Write;

pub const GLOBAL_METADATA_KEY: &str = "@meta@";

pub struct MetadataAgent {
    descriptors: BTreeMap<String, String>,
}

impl MetadataAgent {
    /// `descriptors` maps application identifier to an opaque version descriptor.
    pub fn new(descriptors: BTreeMap<String, String>) -> Self {
        Self { descriptors }
    }
}

#[async_trait]
impl BackupAgent for MetadataAgent {
    async fn on_backup(
        &self,
        old_state: Bytes,
        data: &mut PayloadWriter,
        new_state: &mut StateWriter,
    ) -> anyhow::Result<()> {
        let previous: BTreeMap<String, String> = if old_state.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(&old_state)?
        };

        if previous.is_empty() {
            data.write_entity(GLOBAL_METADATA_KEY, env!("CARGO_PKG_VERSION").as_bytes())?;
        }

        for (id, descriptor) in &self.descriptors {
            if previous.get(id) != Some(descriptor) {
                data.write_entity(id, descriptor.as_bytes())?;
            }
        }
        for id in previous.keys().filter(|id| !self.descriptors.contains_key(*id)) {
            data.write_deletion(id)?;
        }

        new_state.write_all(&serde_json::to_vec(&self.descriptors)?)?;
        Ok(())
    }
}
