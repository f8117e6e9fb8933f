// JSON snapshot persistence for the CLI.
//
// The whole store is loaded into a `MemoryStore`, mutated, then written back.
// Callers hold the advisory lock from `lock()` for the whole load/save cycle so
// two processes never interleave.

use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::store::memory::{MemoryStore, Snapshot};

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Open the lock file next to the snapshot. Take the guard with
    /// `try_write()` and keep it alive until `save` returns.
    pub fn lock(&self) -> Result<RwLock<File>, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.sibling(".lock"))?;
        Ok(RwLock::new(file))
    }

    /// Load the snapshot; a missing file yields an empty store
    pub async fn load(&self) -> Result<MemoryStore, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No snapshot yet, starting empty");
                return Ok(MemoryStore::new());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        MemoryStore::from_snapshot(snapshot)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    /// Write through a temporary file and rename so readers never see a partial snapshot
    pub async fn save(&self, store: &MemoryStore) -> Result<(), StoreError> {
        let snapshot = store.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.sibling(".tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(
            path = %self.path.display(),
            protocols = snapshot.protocols.len(),
            audit_entries = snapshot.audit.len(),
            "Snapshot saved"
        );
        Ok(())
    }
}
