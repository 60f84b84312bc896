//! Metadata stores holding the authoritative mount entries
//!
//! The router only ever reads from a store through [`MountStore`];
//! administrative mutations land in the store and become visible to the
//! router on its next refresh.

use async_trait::async_trait;
use fedns_common::{now_micros, FedNsError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::mount_table::MountEntry;
use crate::path;

const MOUNT_TABLE_TREE: &str = "mount_table";

/// Source of mount entries for the mount table cache
#[async_trait]
pub trait MountStore: Send + Sync {
    /// Fetch the full entry set
    async fn list_entries(&self) -> Result<Vec<MountEntry>>;

    /// Change notifications; the value is a generation counter bumped on every mutation
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Normalize the key of an entry written through an admin mutation and stamp its dates
fn prepare_upsert(mut entry: MountEntry, existing: Option<&MountEntry>) -> Result<MountEntry> {
    entry.source_path = path::normalize(&entry.source_path)?;
    let now = now_micros();
    entry.date_created = existing.map(|e| e.date_created).unwrap_or(now);
    entry.date_modified = now;
    Ok(entry)
}

/// In-process mount store
pub struct MemoryMountStore {
    entries: RwLock<BTreeMap<String, MountEntry>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    changes: watch::Sender<u64>,
}

impl Default for MemoryMountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMountStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            changes,
        }
    }

    /// Create a store pre-populated with `entries`
    pub async fn with_entries(entries: impl IntoIterator<Item = MountEntry>) -> Result<Self> {
        let store = Self::new();
        for entry in entries {
            store.upsert(entry).await?;
        }
        Ok(store)
    }

    /// Add or replace the entry keyed by its source path
    pub async fn upsert(&self, entry: MountEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = path::normalize(&entry.source_path)?;
        let entry = prepare_upsert(entry, entries.get(&key))?;
        debug!("Upserted mount entry {}", entry.source_path);
        entries.insert(entry.source_path.clone(), entry);
        drop(entries);
        self.bump();
        Ok(())
    }

    /// Remove the entry at `source_path`; returns whether one existed
    pub async fn remove(&self, source_path: &str) -> Result<bool> {
        let key = path::normalize(source_path)?;
        let removed = self.entries.write().await.remove(&key).is_some();
        if removed {
            debug!("Removed mount entry {}", key);
            self.bump();
        }
        Ok(removed)
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every fetch by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

#[async_trait]
impl MountStore for MemoryMountStore {
    async fn list_entries(&self) -> Result<Vec<MountEntry>> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(FedNsError::MetadataStoreUnavailable(
                "in-memory store marked unavailable".into(),
            ));
        }
        Ok(self.entries.read().await.values().cloned().collect())
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}

/// Durable mount store backed by sled
pub struct SledMountStore {
    db: sled::Db,
    entries: sled::Tree,
    changes: watch::Sender<u64>,
}

fn storage_err(e: sled::Error) -> FedNsError {
    FedNsError::Storage(e.to_string())
}

/// Another process holding the database lock is transient; anything else is not
fn open_err(e: sled::Error) -> FedNsError {
    let message = e.to_string();
    if message.contains("could not acquire lock") {
        FedNsError::MetadataStoreUnavailable(message)
    } else {
        FedNsError::Storage(message)
    }
}

impl SledMountStore {
    /// Open (or create) a store at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(open_err)?;
        let entries = db.open_tree(MOUNT_TABLE_TREE).map_err(storage_err)?;
        let (changes, _) = watch::channel(0);
        debug!("Opened mount store at {:?} ({} entries)", path.as_ref(), entries.len());
        Ok(Self { db, entries, changes })
    }

    /// Add or replace the entry keyed by its source path
    pub fn upsert(&self, entry: MountEntry) -> Result<()> {
        let key = path::normalize(&entry.source_path)?;
        let existing = self.get(&key)?;
        let entry = prepare_upsert(entry, existing.as_ref())?;
        let value = bincode::serialize(&entry)?;
        self.entries.insert(key.as_bytes(), value).map_err(storage_err)?;
        self.entries.flush().map_err(storage_err)?;
        debug!("Saved mount entry {}", key);
        self.bump();
        Ok(())
    }

    /// Remove the entry at `source_path`; returns whether one existed
    pub fn remove(&self, source_path: &str) -> Result<bool> {
        let key = path::normalize(source_path)?;
        let removed = self.entries.remove(key.as_bytes()).map_err(storage_err)?.is_some();
        if removed {
            self.entries.flush().map_err(storage_err)?;
            debug!("Deleted mount entry {}", key);
            self.bump();
        }
        Ok(removed)
    }

    pub fn get(&self, source_path: &str) -> Result<Option<MountEntry>> {
        match self.entries.get(source_path.as_bytes()).map_err(storage_err)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// All entries ordered by source path
    pub fn entries(&self) -> Result<Vec<MountEntry>> {
        let mut entries = Vec::new();
        for item in self.entries.iter() {
            let (_, value) = item.map_err(storage_err)?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

#[async_trait]
impl MountStore for SledMountStore {
    async fn list_entries(&self) -> Result<Vec<MountEntry>> {
        self.entries()
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}

/// Sled mount store that holds the database lock only while a fetch runs.
///
/// sled allows one open handle per directory, so a long-running router reads
/// through this type and admin commands open a [`SledMountStore`] on the same
/// directory in between fetches. There is no change feed across processes;
/// admin changes are picked up by the periodic refresh.
pub struct SharedSledMountStore {
    path: PathBuf,
}

impl SharedSledMountStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        info!("Using shared mount store at {:?}", path.as_ref());
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MountStore for SharedSledMountStore {
    async fn list_entries(&self) -> Result<Vec<MountEntry>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || SledMountStore::open(&path)?.entries())
            .await
            .map_err(|e| FedNsError::Other(format!("mount store read task failed: {}", e)))?
    }
}
