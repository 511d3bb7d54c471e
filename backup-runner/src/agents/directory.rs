//! Agent backing up every file under an application's data directory.
//!
//! Each file is one entity keyed by its `/`-separated path relative to the root. The agent
//! state is a manifest of (size, mtime) per file; an incremental pass only emits files whose
//! size or mtime changed, plus deletion markers for files that disappeared.

use anyhow::Context;
use async_trait::async_trait;
use backup_engine::payload::{PayloadWriter, StateWriter};
use backup_engine::BackupAgent;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Default)]
struct Scan {
    changed: Vec<(String, Vec<u8>)>,
    deleted: Vec<String>,
    unchanged: usize,
    manifest: Manifest,
}

pub struct DirectoryAgent {
    id: String,
    root: PathBuf,
    exclude: Vec<String>,
}

impl DirectoryAgent {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            exclude,
        }
    }
}

#[async_trait]
impl BackupAgent for DirectoryAgent {
    async fn on_backup(
        &self,
        old_state: Bytes,
        data: &mut PayloadWriter,
        new_state: &mut StateWriter,
    ) -> anyhow::Result<()> {
        let previous: Manifest = if old_state.is_empty() {
            Manifest::default()
        } else {
            serde_json::from_slice(&old_state).context("Corrupt manifest state")?
        };

        let root = self.root.clone();
        let exclude = self.exclude.clone();
        let scan = tokio::task::spawn_blocking(move || scan(&root, &exclude, &previous)).await??;

        for (key, content) in &scan.changed {
            data.write_entity(key, content)?;
        }
        for key in &scan.deleted {
            data.write_deletion(key)?;
        }
        debug!(
            app = %self.id,
            changed = scan.changed.len(),
            deleted = scan.deleted.len(),
            unchanged = scan.unchanged,
            bytes = data.len(),
            "Scanned application data"
        );

        if let Some(quota) = data.quota() {
            if data.len() as u64 > quota {
                warn!(app = %self.id, size = data.len(), quota, "Payload larger than transport quota");
            }
        }

        new_state.write_all(&serde_json::to_vec(&scan.manifest)?)?;
        Ok(())
    }

    async fn on_quota_exceeded(&self, backup_size: u64, quota: u64) {
        warn!(app = %self.id, backup_size, quota, "Backup rejected for exceeding quota");
    }

    fn fail(&self, reason: &str) {
        warn!(app = %self.id, reason, "Backup result discarded");
    }
}

fn is_excluded(entry: &DirEntry, exclude: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    exclude.iter().any(|pattern| *pattern == name)
}

fn relative_key(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn scan(root: &Path, exclude: &[String], previous: &Manifest) -> anyhow::Result<Scan> {
    let mut scan = Scan::default();

    if root.exists() {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_excluded(e, exclude));

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry.metadata()?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let current = ManifestEntry {
                size: metadata.len(),
                mtime,
            };
            let key = relative_key(entry.path(), root);

            if previous.files.get(&key) == Some(&current) {
                scan.unchanged += 1;
            } else {
                let content = std::fs::read(entry.path())
                    .with_context(|| format!("Failed to read {}", entry.path().display()))?;
                scan.changed.push((key.clone(), content));
            }
            scan.manifest.files.insert(key, current);
        }
    } else {
        debug!(root = %root.display(), "Data directory missing, treating as empty");
    }

    scan.deleted = previous
        .files
        .keys()
        .filter(|key| !scan.manifest.files.contains_key(*key))
        .cloned()
        .collect();

    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_engine::payload::{decode, Entity};
    use tempfile::TempDir;

    async fn backup(agent: &DirectoryAgent, old_state: Bytes) -> (Vec<Entity>, Bytes) {
        let mut data = PayloadWriter::new(0, None);
        let mut state = StateWriter::new();
        agent.on_backup(old_state, &mut data, &mut state).await.unwrap();
        (decode(&data.into_bytes()).unwrap(), state.into_bytes())
    }

    fn keys(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_full_backup_emits_every_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), b"beta").unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), b"ref").unwrap();

        let agent = DirectoryAgent::new("app", tmp.path(), vec![".git".to_string()]);
        let (entities, state) = backup(&agent, Bytes::new()).await;

        assert_eq!(keys(&entities), ["a.txt", "sub/b.txt"]);
        assert_eq!(entities[0].data, Some(Bytes::from_static(b"alpha")));

        let manifest: Manifest = serde_json::from_slice(&state).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files["sub/b.txt"].size, 4);
    }

    #[tokio::test]
    async fn test_incremental_backup_emits_changes_and_deletions() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"same").unwrap();
        std::fs::write(tmp.path().join("grow.txt"), b"small").unwrap();
        std::fs::write(tmp.path().join("gone.txt"), b"bye").unwrap();

        let agent = DirectoryAgent::new("app", tmp.path(), Vec::new());
        let (_, state) = backup(&agent, Bytes::new()).await;

        std::fs::write(tmp.path().join("grow.txt"), b"much larger now").unwrap();
        std::fs::remove_file(tmp.path().join("gone.txt")).unwrap();
        std::fs::write(tmp.path().join("new.txt"), b"hello").unwrap();

        let (entities, _) = backup(&agent, state).await;

        assert_eq!(keys(&entities), ["grow.txt", "new.txt", "gone.txt"]);
        assert_eq!(entities[2].data, None);
    }

    #[tokio::test]
    async fn test_missing_directory_deletes_everything() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();

        let agent = DirectoryAgent::new("app", &root, Vec::new());
        let (_, state) = backup(&agent, Bytes::new()).await;
        std::fs::remove_dir_all(&root).unwrap();

        let (entities, state) = backup(&agent, state).await;
        assert_eq!(keys(&entities), ["a.txt"]);
        assert_eq!(entities[0].data, None);
        let manifest: Manifest = serde_json::from_slice(&state).unwrap();
        assert!(manifest.files.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_fails() {
        let tmp = TempDir::new().unwrap();
        let agent = DirectoryAgent::new("app", tmp.path(), Vec::new());
        let mut data = PayloadWriter::new(0, None);
        let mut state = StateWriter::new();
        let result = agent
            .on_backup(Bytes::from_static(b"{not json"), &mut data, &mut state)
            .await;
        assert!(result.is_err());
    }
}
