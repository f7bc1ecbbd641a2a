//! Durable, transactional metadata store.
//!
//! All snapshot, blob, lease and root-label records live in one [`Tables`]
//! value guarded by a mutex. A transaction runs against a copy of the tables;
//! the copy is written to disk atomically (tempfile + rename) and only then
//! replaces the in-memory state. Transactions are therefore serialized, and a
//! crash leaves either the old or the new document on disk.
//!
//! Persistence layout: a single JSON document (`metadata.json`) per worker.

use crate::digest::Digest;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Current metadata document version.
pub const METADATA_VERSION: u32 = 1;

/// Lifecycle stage of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Writable layer that may be committed.
    Active,
    /// Immutable layer; may be a parent.
    Committed,
    /// Read-only layer that is never committed.
    View,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Active => "active",
            Kind::Committed => "committed",
            Kind::View => "view",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk usage of a snapshot layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub size: u64,
    pub inodes: u64,
}

/// A resource that can be pinned by a lease or a root label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Resource {
    Content(Digest),
    Snapshot(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Content(digest) => write!(f, "content/{}", digest),
            Resource::Snapshot(key) => write!(f, "snapshot/{}", key),
        }
    }
}

/// Stored record of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Backend storage handle.
    pub id: u64,
    pub kind: Kind,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Measured at commit time.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Stored record of a committed blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Stored record of a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pins: BTreeSet<Resource>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The complete metadata state of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tables {
    pub version: u32,
    /// Next backend storage handle to hand out.
    pub next_id: u64,
    #[serde(default)]
    pub snapshots: BTreeMap<String, SnapshotRecord>,
    #[serde(default)]
    pub blobs: BTreeMap<Digest, BlobRecord>,
    #[serde(default)]
    pub leases: BTreeMap<String, LeaseRecord>,
    /// Root label name -> pinned resource.
    #[serde(default)]
    pub roots: BTreeMap<String, Resource>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            next_id: 1,
            snapshots: BTreeMap::new(),
            blobs: BTreeMap::new(),
            leases: BTreeMap::new(),
            roots: BTreeMap::new(),
        }
    }
}

impl Tables {
    /// Allocate a fresh backend storage handle.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Keys of snapshots whose parent is `key`.
    pub fn children_of<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.snapshots
            .iter()
            .filter(move |(_, record)| record.parent.as_deref() == Some(key))
            .map(|(child, _)| child)
    }

    /// Names of live leases and root labels pinning `resource`.
    pub fn pinned_by(&self, resource: &Resource, now: DateTime<Utc>) -> Vec<String> {
        let leases = self
            .leases
            .iter()
            .filter(|(_, lease)| !lease.is_expired(now) && lease.pins.contains(resource))
            .map(|(id, _)| format!("lease {}", id));
        let roots = self
            .roots
            .iter()
            .filter(|(_, pinned)| *pinned == resource)
            .map(|(name, _)| format!("root label {}", name));
        leases.chain(roots).collect()
    }
}

/// Handle to a worker's metadata store.
#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    tables: Mutex<Tables>,
    /// Held shared by content/snapshot mutations and exclusively by GC.
    sweep: RwLock<()>,
}

impl Db {
    /// Open the metadata store at `path`, creating an empty one if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let tables = match fs::read_to_string(&path) {
            Ok(content) => {
                let tables: Tables = serde_json::from_str(&content)?;
                if tables.version != METADATA_VERSION {
                    return Err(Error::config(format!(
                        "unsupported metadata version {} in {}",
                        tables.version,
                        path.display()
                    )));
                }
                tables
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let tables = Tables::default();
                write_atomic(&path, &tables)?;
                tables
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            path = %path.display(),
            snapshots = tables.snapshots.len(),
            blobs = tables.blobs.len(),
            leases = tables.leases.len(),
            "opened metadata store"
        );

        Ok(Self {
            path,
            tables: Mutex::new(tables),
            sweep: RwLock::new(()),
        })
    }

    /// Path of the metadata document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tables) -> Result<T>) -> Result<T> {
        let guard = self.lock()?;
        f(&guard)
    }

    /// Run a read-write transaction.
    ///
    /// Changes become visible to other transactions only after they have been
    /// persisted. If `f` fails, nothing is written.
    pub fn update<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let mut working = guard.clone();
        let out = f(&mut working)?;
        if working != *guard {
            write_atomic(&self.path, &working)?;
            *guard = working;
        }
        Ok(out)
    }

    /// A point-in-time copy of all tables.
    pub fn snapshot(&self) -> Result<Tables> {
        self.view(|tables| Ok(tables.clone()))
    }

    /// Shared side of the sweep lock, held while creating or committing objects.
    pub(crate) fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.sweep
            .read()
            .map_err(|_| Error::invalid_state("metadata", "sweep lock poisoned"))
    }

    /// Exclusive side of the sweep lock, held for a whole GC pass.
    pub(crate) fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.sweep
            .write()
            .map_err(|_| Error::invalid_state("metadata", "sweep lock poisoned"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::invalid_state("metadata", "metadata lock poisoned"))
    }
}

fn write_atomic(path: &Path, tables: &Tables) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::config(format!("metadata path has no parent: {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut temp_file, tables)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path)?;
    Ok(())
}

/// Per-key mutual exclusion for in-flight operations.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<String>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or return `None` if another caller holds it.
    pub fn try_lock(&self, key: &str) -> Result<Option<KeyGuard<'_>>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::invalid_state(key, "key lock poisoned"))?;
        if !held.insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(KeyGuard {
            locks: self,
            key: key.to_string(),
        }))
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(true)
    }
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blob_record(size: u64) -> BlobRecord {
        let now = Utc::now();
        BlobRecord {
            size,
            created_at: now,
            updated_at: now,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_open_creates_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.json");

        let db = Db::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.snapshot().unwrap(), Tables::default());
    }

    #[test]
    fn test_update_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.json");
        let digest = Digest::of_bytes(b"layer");

        {
            let db = Db::open(&path).unwrap();
            db.update(|tables| {
                tables.blobs.insert(digest, blob_record(5));
                tables
                    .roots
                    .insert("image".to_string(), Resource::Content(digest));
                Ok(())
            })
            .unwrap();
        }

        let db = Db::open(&path).unwrap();
        let tables = db.snapshot().unwrap();
        assert_eq!(tables.blobs[&digest].size, 5);
        assert_eq!(tables.roots["image"], Resource::Content(digest));
    }

    #[test]
    fn test_failed_update_changes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::open(temp_dir.path().join("metadata.json")).unwrap();

        let result: Result<()> = db.update(|tables| {
            tables.allocate_id();
            tables.blobs.insert(Digest::of_bytes(b"x"), blob_record(1));
            Err(Error::invalid_state("x", "abort"))
        });
        assert!(result.is_err());

        let tables = db.snapshot().unwrap();
        assert_eq!(tables.next_id, 1);
        assert!(tables.blobs.is_empty());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.json");
        let tables = Tables {
            version: 99,
            ..Tables::default()
        };
        fs::write(&path, serde_json::to_string(&tables).unwrap()).unwrap();

        assert!(matches!(Db::open(&path), Err(Error::Config { .. })));
    }

    #[test]
    fn test_pinned_by_ignores_expired_leases() {
        let now = Utc::now();
        let resource = Resource::Snapshot("S1".to_string());
        let mut tables = Tables::default();
        tables.leases.insert(
            "live".to_string(),
            LeaseRecord {
                created_at: now,
                expires_at: None,
                labels: BTreeMap::new(),
                pins: [resource.clone()].into_iter().collect(),
            },
        );
        tables.leases.insert(
            "stale".to_string(),
            LeaseRecord {
                created_at: now,
                expires_at: Some(now - chrono::Duration::seconds(1)),
                labels: BTreeMap::new(),
                pins: [resource.clone()].into_iter().collect(),
            },
        );

        assert_eq!(tables.pinned_by(&resource, now), vec!["lease live".to_string()]);
    }

    #[test]
    fn test_key_locks_are_exclusive() {
        let locks = KeyLocks::new();
        let guard = locks.try_lock("L1").unwrap().unwrap();
        assert!(locks.try_lock("L1").unwrap().is_none());
        assert!(locks.is_locked("L1"));
        drop(guard);
        assert!(!locks.is_locked("L1"));
        assert!(locks.try_lock("L1").unwrap().is_some());
    }

    #[test]
    fn test_resource_serialization() {
        let resource = Resource::Snapshot("S1".to_string());
        let json = serde_json::to_string(&resource).unwrap();
        assert_eq!(json, r#"{"kind":"snapshot","key":"S1"}"#);
    }
}
