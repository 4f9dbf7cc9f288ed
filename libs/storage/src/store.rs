//! Dead-Letter Store
//!
//! One directory, one file per shard. Shards are created by a failed
//! forward, drained by the recovery loop and then deleted. All calls block
//! on the filesystem; async callers go through `spawn_blocking`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::engine::{read_shard, write_shard, ShardContents, TEMP_SUFFIX};
use crate::error::{Result, StorageError};
use crate::shard::{ShardClock, ShardId, ShardKind};

/// Number of shards on disk by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardCounts {
    pub retryable: u64,
    pub terminal: u64,
}

/// Leveled durable store of failed batches
#[derive(Debug)]
pub struct DeadLetterStore {
    root: PathBuf,
    ceiling: u8,
    clock: ShardClock,
}

impl DeadLetterStore {
    /// Open an existing root directory
    ///
    /// A missing root is an error; the directory is never created here.
    pub fn open(root: impl Into<PathBuf>, ceiling: u8) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StorageError::RootMissing { path: root });
        }
        info!(?root, ceiling, "Opened dead-letter store");
        Ok(Self {
            root,
            ceiling,
            clock: ShardClock::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ceiling(&self) -> u8 {
        self.ceiling
    }

    /// Persist one record in a new shard at `level`
    ///
    /// Levels at or above the ceiling produce a terminal shard.
    pub fn persist(&self, key: &str, payload: &[u8], level: u8) -> Result<ShardId> {
        let kind = ShardKind::for_level(level, self.ceiling);
        let mut id = ShardId::new(kind, self.clock.next());
        while self.path_of(&id).exists() {
            id = ShardId::new(kind, self.clock.next());
        }

        let mut contents = ShardContents::new();
        contents.set(key, payload);
        write_shard(&self.root, &id.file_name(), &contents)?;

        debug!(shard = %id, key, bytes = payload.len(), "Persisted dead-letter record");
        Ok(id)
    }

    /// Shards still eligible for automatic retry, oldest lowest level first
    pub fn list_retryable(&self) -> Result<Vec<ShardId>> {
        let mut ids: Vec<ShardId> = self
            .scan()?
            .into_iter()
            .filter(|id| !id.kind.is_terminal())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn list_terminal(&self) -> Result<Vec<ShardId>> {
        let mut ids: Vec<ShardId> = self
            .scan()?
            .into_iter()
            .filter(|id| id.kind.is_terminal())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn counts(&self) -> Result<ShardCounts> {
        let mut counts = ShardCounts::default();
        for id in self.scan()? {
            if id.kind.is_terminal() {
                counts.terminal += 1;
            } else {
                counts.retryable += 1;
            }
        }
        Ok(counts)
    }

    pub fn read(&self, id: &ShardId) -> Result<ShardContents> {
        let path = self.path_of(id);
        if !path.exists() {
            return Err(StorageError::NotFound { id: *id });
        }
        read_shard(&path)
    }

    pub fn remove(&self, id: &ShardId) -> Result<()> {
        let path = self.path_of(id);
        fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound { id: *id },
            _ => StorageError::io(&path, e),
        })?;
        debug!(shard = %id, "Removed dead-letter shard");
        Ok(())
    }

    /// Delete temporary files left by an interrupted write
    pub fn reap_temporary(&self) -> Result<usize> {
        let mut reaped = 0;
        for entry in self.entries()? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_SUFFIX) {
                match fs::remove_file(&path) {
                    Ok(()) => reaped += 1,
                    Err(e) => warn!(?path, error = %e, "Failed to remove temporary shard"),
                }
            }
        }
        Ok(reaped)
    }

    fn path_of(&self, id: &ShardId) -> PathBuf {
        self.root.join(id.file_name())
    }

    fn entries(&self) -> Result<Vec<fs::DirEntry>> {
        let reader = fs::read_dir(&self.root).map_err(|e| StorageError::io(&self.root, e))?;
        let mut entries = Vec::new();
        for entry in reader {
            entries.push(entry.map_err(|e| StorageError::io(&self.root, e))?);
        }
        Ok(entries)
    }

    fn scan(&self) -> Result<Vec<ShardId>> {
        let mut ids = Vec::new();
        for entry in self.entries()? {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(ShardId::parse) {
                Some(id) => ids.push(id),
                None => debug!(name = ?name, "Ignoring non-shard file"),
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("errors");
        assert!(matches!(
            DeadLetterStore::open(&missing, 5),
            Err(StorageError::RootMissing { .. })
        ));
    }

    #[test]
    fn test_persist_and_read_back() {
        let dir = tempdir().unwrap();
        let store = DeadLetterStore::open(dir.path(), 5).unwrap();

        let id = store.persist("/?query=INSERT%20INTO%20t%20VALUES", b"(1),(2)", 1).unwrap();
        assert_eq!(id.kind, ShardKind::Retryable(1));

        let contents = store.read(&id).unwrap();
        assert_eq!(
            contents.get("/?query=INSERT%20INTO%20t%20VALUES"),
            Some(&b"(1),(2)"[..])
        );
        assert_eq!(store.list_retryable().unwrap(), vec![id]);
    }

    #[test]
    fn test_terminal_excluded_from_retry_scan() {
        let dir = tempdir().unwrap();
        let store = DeadLetterStore::open(dir.path(), 3).unwrap();

        let retry = store.persist("/a", b"1", 2).unwrap();
        let terminal = store.persist("/a", b"1", 3).unwrap();
        assert!(terminal.kind.is_terminal());

        assert_eq!(store.list_retryable().unwrap(), vec![retry]);
        assert_eq!(store.list_terminal().unwrap(), vec![terminal]);
        assert_eq!(
            store.counts().unwrap(),
            ShardCounts {
                retryable: 1,
                terminal: 1
            }
        );
    }

    #[test]
    fn test_scan_sorted_and_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let store = DeadLetterStore::open(dir.path(), 5).unwrap();

        let second = store.persist("/b", b"2", 2).unwrap();
        let first_old = store.persist("/a", b"1", 1).unwrap();
        let first_new = store.persist("/c", b"3", 1).unwrap();
        fs::write(dir.path().join("notes.idx"), b"ignored").unwrap();
        fs::write(dir.path().join("41.tmp"), b"partial").unwrap();
        fs::create_dir(dir.path().join("3999")).unwrap();

        assert_eq!(
            store.list_retryable().unwrap(),
            vec![first_old, first_new, second]
        );
    }

    #[test]
    fn test_leading_zero_names_are_not_counted() {
        let dir = tempdir().unwrap();
        let store = DeadLetterStore::open(dir.path(), 5).unwrap();

        fs::write(dir.path().join("10005"), b"PHDLQ001").unwrap();
        fs::write(dir.path().join("x00"), b"PHDLQ001").unwrap();

        assert!(store.list_retryable().unwrap().is_empty());
        assert_eq!(store.counts().unwrap(), ShardCounts::default());
    }

    #[test]
    fn test_remove_and_reap() {
        let dir = tempdir().unwrap();
        let store = DeadLetterStore::open(dir.path(), 5).unwrap();

        let id = store.persist("/a", b"1", 1).unwrap();
        store.remove(&id).unwrap();
        assert!(store.list_retryable().unwrap().is_empty());
        assert!(matches!(store.remove(&id), Err(StorageError::NotFound { .. })));
        assert!(matches!(store.read(&id), Err(StorageError::NotFound { .. })));

        fs::write(dir.path().join("17.tmp"), b"partial").unwrap();
        assert_eq!(store.reap_temporary().unwrap(), 1);
        assert!(!dir.path().join("17.tmp").exists());
    }
}
