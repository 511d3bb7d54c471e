//! Directory-backed transport.
//!
//! Each accepted submission is stored zstd-compressed as `<root>/<destination>/<item>/<seq>.kv.zst`.
//! A non-incremental submission clears the item's previous sets first. `finish_backup`
//! writes a `backup-set.json` summary of the run.

use super::{Transport, TransportResult};
use crate::outcome::{codes, flags};
use crate::store::encode_name;
use crate::utils::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};

const SET_SUFFIX: &str = ".kv.zst";
const SUMMARY_FILE: &str = "backup-set.json";

#[derive(Debug, Clone)]
pub struct LocalTransportOptions {
    pub root: PathBuf,
    pub destination: String,
    /// Per-item payload limit in bytes
    pub quota_bytes: Option<u64>,
    /// Flags advertised to agents
    pub transport_flags: u32,
    /// zstd level for stored sets
    pub compression_level: i32,
}

pub struct LocalTransport {
    options: LocalTransportOptions,
    dir: PathBuf,
    accepted: Mutex<Vec<String>>,
}

#[derive(Serialize)]
struct BackupSetSummary<'a> {
    destination: &'a str,
    finished_at: String,
    items: &'a [String],
}

impl LocalTransport {
    pub fn new(options: LocalTransportOptions) -> Self {
        let dir = options.root.join(encode_name(&options.destination));
        Self {
            options,
            dir,
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_dir(&self, item: &str) -> PathBuf {
        self.dir.join(encode_name(item))
    }

    async fn blocking<T, F>(f: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }
}

fn stored_sets(item_dir: &Path) -> std::io::Result<usize> {
    match std::fs::read_dir(item_dir) {
        Ok(entries) => {
            let mut count = 0;
            for entry in entries {
                if entry?.file_name().to_string_lossy().ends_with(SET_SUFFIX) {
                    count += 1;
                }
            }
            Ok(count)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn destination(&self) -> &str {
        &self.options.destination
    }

    async fn initialize_device(&self) -> TransportResult<i32> {
        let dir = self.dir.clone();
        Self::blocking(move || {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            std::fs::create_dir_all(&dir)
        })
        .await?;
        self.accepted.lock().clear();
        tracing::info!(dir = %self.dir.display(), "Initialized local backup destination");
        Ok(codes::TRANSPORT_OK)
    }

    async fn backup_quota(&self, _item: &str, _full_backup: bool) -> TransportResult<u64> {
        Ok(self.options.quota_bytes.unwrap_or(u64::MAX))
    }

    async fn transport_flags(&self) -> TransportResult<u32> {
        Ok(self.options.transport_flags)
    }

    async fn perform_backup(&self, item: &str, payload: Bytes, backup_flags: u32) -> TransportResult<i32> {
        if let Some(quota) = self.options.quota_bytes {
            if payload.len() as u64 > quota {
                tracing::info!(item, size = payload.len(), quota, "Payload over quota");
                return Ok(codes::TRANSPORT_QUOTA_EXCEEDED);
            }
        }

        let item_dir = self.item_dir(item);
        let non_incremental = backup_flags & flags::NON_INCREMENTAL != 0;
        let level = self.options.compression_level;

        let code = Self::blocking(move || {
            let existing = stored_sets(&item_dir)?;
            if !non_incremental && existing == 0 {
                return Ok(codes::TRANSPORT_NON_INCREMENTAL_BACKUP_REQUIRED);
            }
            if non_incremental && item_dir.exists() {
                std::fs::remove_dir_all(&item_dir)?;
            }
            std::fs::create_dir_all(&item_dir)?;

            let seq = if non_incremental { 0 } else { existing };
            let compressed = zstd::encode_all(&payload[..], level)?;
            std::fs::write(item_dir.join(format!("{:06}{}", seq, SET_SUFFIX)), compressed)?;
            Ok(codes::TRANSPORT_OK)
        })
        .await?;

        if code == codes::TRANSPORT_OK {
            self.accepted.lock().push(item.to_string());
        }
        Ok(code)
    }

    async fn finish_backup(&self) -> TransportResult<i32> {
        let items = std::mem::take(&mut *self.accepted.lock());
        let summary = serde_json::to_vec_pretty(&BackupSetSummary {
            destination: &self.options.destination,
            finished_at: chrono::Utc::now().to_rfc3339(),
            items: &items,
        })
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let path = self.dir.join(SUMMARY_FILE);
        let dir = self.dir.clone();
        Self::blocking(move || {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(path, summary)
        })
        .await?;
        Ok(codes::TRANSPORT_OK)
    }
}
