use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use common::errors::*;

use crate::log::LogEntry;

/// The durable subset of a peer's state: everything needed to resume
/// consensus after a crash without replaying RPCs.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub log_tail: Vec<LogEntry>,
}

/// Scoped durable storage for two opaque blobs: the raft state and the
/// application snapshot. Implementations must make `save` atomic: a crash
/// mid-write must never corrupt the previously durable value.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn save_state(&self, state: &PersistentState) -> Result<()>;

    async fn load_state(&self) -> Result<PersistentState>;

    async fn save_snapshot(&self, snapshot: &[u8]) -> Result<()>;

    async fn load_snapshot(&self) -> Result<Vec<u8>>;

    /// Saves both blobs together; a crash between the two writes must never
    /// be observable (the snapshot and the state it refers to move
    /// together).
    async fn save_state_and_snapshot(&self, state: &PersistentState, snapshot: &[u8]) -> Result<()> {
        self.save_snapshot(snapshot).await?;
        self.save_state(state).await
    }
}

/// File-backed [Persister]. Each blob is a separate file written via a
/// write-to-temp-then-rename, so readers never observe a partial write.
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft-state.bin")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("raft-snapshot.bin")
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        async_std::fs::create_dir_all(&self.dir).await?;
        let tmp_path = path.with_extension("tmp");
        async_std::fs::write(&tmp_path, data).await?;
        async_std::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_or_default(&self, path: &Path) -> Result<Vec<u8>> {
        match async_std::fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Persister for FilePersister {
    async fn save_state(&self, state: &PersistentState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.write_atomic(&self.state_path(), &data).await
    }

    async fn load_state(&self) -> Result<PersistentState> {
        let data = self.read_or_default(&self.state_path()).await?;
        if data.is_empty() {
            return Ok(PersistentState::default());
        }
        Ok(bincode::deserialize(&data)?)
    }

    async fn save_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        self.write_atomic(&self.snapshot_path(), snapshot).await
    }

    async fn load_snapshot(&self) -> Result<Vec<u8>> {
        self.read_or_default(&self.snapshot_path()).await
    }
}

/// Purely in-memory [Persister], used by tests that don't care about
/// surviving a process restart on real disk.
pub struct MemoryPersister {
    inner: async_std::sync::Mutex<(PersistentState, Vec<u8>)>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self {
            inner: async_std::sync::Mutex::new((PersistentState::default(), vec![])),
        }
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn save_state(&self, state: &PersistentState) -> Result<()> {
        self.inner.lock().await.0 = state.clone();
        Ok(())
    }

    async fn load_state(&self) -> Result<PersistentState> {
        Ok(self.inner.lock().await.0.clone())
    }

    async fn save_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        self.inner.lock().await.1 = snapshot.to_vec();
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().await.1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn file_persister_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persister = FilePersister::new(dir.path());

        let state = PersistentState {
            current_term: 3,
            voted_for: Some(2),
            snapshot_index: 5,
            snapshot_term: 2,
            log_tail: vec![],
        };
        persister.save_state(&state).await?;
        persister.save_snapshot(b"hello").await?;

        let loaded = persister.load_state().await?;
        assert_eq!(loaded.current_term, 3);
        assert_eq!(loaded.voted_for, Some(2));

        let snapshot = persister.load_snapshot().await?;
        assert_eq!(snapshot, b"hello");
        Ok(())
    }

    #[async_std::test]
    async fn file_persister_defaults_when_absent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persister = FilePersister::new(dir.path());
        let state = persister.load_state().await?;
        assert_eq!(state.current_term, 0);
        assert!(persister.load_snapshot().await?.is_empty());
        Ok(())
    }
}
