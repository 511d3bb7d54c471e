//! Dirty-tracking journal: the identifiers that changed since the last completed run.

use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub trait DataChangedJournal: Send + Sync {
    /// Drop the journal once its items have been backed up.
    fn delete(&self) -> std::io::Result<()>;
}

/// Journal stored as one identifier per line.
#[derive(Debug, Clone)]
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&self, item: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", item)
    }

    /// Distinct identifiers in first-seen order; empty when the journal does not exist.
    pub fn items(&self) -> std::io::Result<Vec<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut seen = HashSet::new();
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(str::to_string)
            .collect())
    }
}

impl DataChangedJournal for FileJournal {
    fn delete(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
