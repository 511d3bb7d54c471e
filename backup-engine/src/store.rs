//! Per-destination persisted backup state.
//!
//! Layout: `<state_root>/<destination>/<encoded item id>`. Blobs are replaced by writing a
//! temp file in the same directory, syncing it, then renaming it over the old blob.

use crate::utils::{EngineError, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(state_root: &Path, destination: &str) -> Self {
        Self {
            dir: state_root.join(encode_name(destination)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, item: &str) -> PathBuf {
        self.dir.join(encode_name(item))
    }

    /// Stored blob, or empty bytes when none exists.
    pub fn read(&self, item: &str) -> Result<Bytes> {
        match std::fs::read(self.path_for(item)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Bytes::new()),
            Err(source) => Err(EngineError::StateStore {
                item: item.to_string(),
                source,
            }),
        }
    }

    /// A blob that exists but is empty counts as absent.
    pub fn has_state(&self, item: &str) -> bool {
        std::fs::metadata(self.path_for(item))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Subset of `items` that currently has state.
    pub fn with_state<'a>(&self, items: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        items
            .into_iter()
            .filter(|item| self.has_state(item))
            .map(str::to_string)
            .collect()
    }

    pub fn write_atomic(&self, item: &str, data: &[u8]) -> Result<()> {
        let wrap = |source: std::io::Error| EngineError::StateStore {
            item: item.to_string(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(wrap)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(wrap)?;
        tmp.write_all(data).map_err(wrap)?;
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(self.path_for(item)).map_err(|e| wrap(e.error))?;

        tracing::debug!(item, bytes = data.len(), "Committed backup state");
        Ok(())
    }

    /// Remove every blob for this destination.
    pub fn reset(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.dir)?;
        tracing::info!(dir = %self.dir.display(), "Reset backup state");
        Ok(())
    }

    /// Decoded identifiers of all stored blobs, sorted.
    pub fn items(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Some(item) = decode_name(&name) {
                items.push(item);
            }
        }
        items.sort();
        Ok(items)
    }
}

fn is_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'@')
}

/// Percent-encode everything outside `[A-Za-z0-9._@-]`; a leading `.` is always encoded so
/// no identifier can name `.`, `..` or a hidden temp file.
pub fn encode_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, b) in id.bytes().enumerate() {
        if is_safe(b) && !(i == 0 && b == b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub fn decode_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
