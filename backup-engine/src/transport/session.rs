//! Per-run view of a transport: initialization bookkeeping and the exactly-once `finish`.

use super::{Transport, TransportResult};
use crate::item::METADATA_SENTINEL;
use crate::outcome::{codes, TransportOutcome};
use crate::store::StateStore;
use crate::utils::{RunAbort, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct TransportSession {
    transport: Arc<dyn Transport>,
    finish_timeout: Duration,
    initialized: bool,
    finished: bool,
}

impl TransportSession {
    pub fn new(transport: Arc<dyn Transport>, finish_timeout: Duration) -> Self {
        Self {
            transport,
            finish_timeout,
            initialized: false,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn destination(&self) -> &str {
        self.transport.destination()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Initialize the destination unless metadata state shows it already holds a backup
    /// set. Initialization wipes the local state so every item goes non-incremental.
    pub async fn ensure_initialized(&mut self, store: &StateStore) -> Result<(), RunAbort> {
        if self.initialized {
            return Ok(());
        }

        let probe = store.clone();
        let has_metadata = tokio::task::spawn_blocking(move || probe.has_state(METADATA_SENTINEL))
            .await
            .map_err(crate::EngineError::from)?;

        if !has_metadata {
            info!(transport = self.name(), "No metadata state, initializing destination");
            let reset_store = store.clone();
            tokio::task::spawn_blocking(move || reset_store.reset())
                .await
                .map_err(crate::EngineError::from)??;

            let status = self.transport.initialize_device().await?;
            if status != codes::TRANSPORT_OK {
                return Err(RunAbort::InitializationFailed(status));
            }
        }

        self.initialized = true;
        Ok(())
    }

    pub async fn quota(&self, item: &str, full_backup: bool) -> TransportResult<u64> {
        let quota = self.transport.backup_quota(item, full_backup).await?;
        debug!(item, quota, "Fetched backup quota");
        Ok(quota)
    }

    /// Re-read on every call so flag changes take effect on the next item.
    pub async fn transport_flags(&self) -> TransportResult<u32> {
        self.transport.transport_flags().await
    }

    pub async fn perform_backup(
        &self,
        item: &str,
        payload: Bytes,
        flags: u32,
    ) -> TransportResult<TransportOutcome> {
        let size = payload.len();
        let code = self.transport.perform_backup(item, payload, flags).await?;
        let outcome = TransportOutcome::from_code(code);
        debug!(item, size, flags, code, ?outcome, "Transport accepted submission");
        Ok(outcome)
    }

    /// Release the transport's per-run resources. Only runs once, and only after a
    /// successful initialization; failures are logged.
    pub async fn finish(&mut self) {
        if !self.initialized || self.finished {
            return;
        }
        self.finished = true;

        let result = tokio::time::timeout(self.finish_timeout, self.transport.finish_backup())
            .await
            .unwrap_or(Err(TransportError::Timeout(self.finish_timeout)));

        match result {
            Ok(codes::TRANSPORT_OK) => info!(transport = self.name(), "Transport finished"),
            Ok(code) => warn!(transport = self.name(), code, "Transport finish returned error status"),
            Err(e) => warn!(transport = self.name(), error = %e, "Transport finish failed"),
        }
    }
}
