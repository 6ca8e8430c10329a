//! Backing store persisted as a single JSON document

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::{stage, BackingStore, Mutation, Row, StoreResult, Tables};
use crate::entity::EntityId;

/// Backing store that snapshots every table to one JSON file.
///
/// Reads are served from memory. A commit stages the batch, writes the full
/// snapshot to a temp file next to `<path>`, syncs it, renames it over
/// `<path>`, and only then publishes the staged tables, so a failed write
/// leaves both the file and the in-memory view at the previous commit.
///
/// Commits through one store are serialized: each one stages from the tables
/// left by the previous commit. Two stores opened on the same path still
/// overwrite each other's commits.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    /// Published commit count. Held while staging against, or replacing, the
    /// current snapshot.
    version: Mutex<u64>,
    commits: AtomicU64,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing rows if the file exists
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = std::fs::read(&path)?;
            if raw.is_empty() {
                Tables::new()
            } else {
                serde_json::from_slice(&raw)?
            }
        } else {
            Tables::new()
        };

        tracing::debug!(path = %path.display(), collections = tables.len(), "JSON store opened");

        Ok(Self {
            path,
            tables: RwLock::new(tables),
            version: Mutex::new(0),
            commits: AtomicU64::new(0),
        })
    }

    /// File the store persists to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique temp file in the target's directory, so concurrent writers never
    /// share one
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        self.path.with_file_name(name)
    }

    fn lock_version(&self) -> MutexGuard<'_, u64> {
        self.version.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, batch: &[Mutation]) -> StoreResult<(Tables, Vec<u8>)> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let staged = stage(&tables, batch)?;
        let bytes = serde_json::to_vec_pretty(&staged)?;
        Ok((staged, bytes))
    }

    /// Move a fully written temp file over the target and publish `staged`.
    /// The caller holds `version` and has checked it against its base.
    fn replace(&self, temp: &Path, staged: Tables, version: &mut u64) -> StoreResult<()> {
        if let Err(e) = std::fs::rename(temp, &self.path) {
            let _ = std::fs::remove_file(temp);
            return Err(e.into());
        }
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = staged;
        *version += 1;
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

async fn write_synced_async(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, bytes).await?;
    tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?
        .sync_all()
        .await
}

#[async_trait]
impl BackingStore for JsonFileStore {
    fn fetch(&self, collection: &str, id: EntityId) -> StoreResult<Option<Row>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(collection)
            .and_then(|table| table.get(&id))
            .cloned())
    }

    async fn fetch_async(&self, collection: &str, id: EntityId) -> StoreResult<Option<Row>> {
        self.fetch(collection, id)
    }

    fn scan(&self, collection: &str) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(collection)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_async(&self, collection: &str) -> StoreResult<Vec<Row>> {
        self.scan(collection)
    }

    fn commit(&self, batch: &[Mutation]) -> StoreResult<usize> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        let mut version = self.lock_version();
        let (staged, bytes) = self.stage(batch)?;
        let temp = self.temp_path();
        if let Err(e) = write_synced(&temp, &bytes) {
            let _ = std::fs::remove_file(&temp);
            return Err(e.into());
        }
        self.replace(&temp, staged, &mut version)?;
        Ok(batch.len())
    }

    /// The temp file is written without holding the commit lock. If another
    /// commit was published meanwhile, the batch is staged again on top of it.
    async fn commit_async(&self, batch: &[Mutation]) -> StoreResult<usize> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        loop {
            let (base, staged, bytes) = {
                let version = self.lock_version();
                let (staged, bytes) = self.stage(batch)?;
                (*version, staged, bytes)
            };

            let temp = self.temp_path();
            if let Err(e) = write_synced_async(&temp, &bytes).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e.into());
            }

            {
                let mut version = self.lock_version();
                if *version == base {
                    self.replace(&temp, staged, &mut version)?;
                    return Ok(batch.len());
                }
            }

            tracing::debug!(path = %self.path.display(), "Store changed during commit, restaging");
            let _ = tokio::fs::remove_file(&temp).await;
        }
    }

    fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}
