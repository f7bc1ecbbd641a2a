//! Layered filesystem snapshots.
//!
//! Snapshots form a tree through their parent keys. An active snapshot is a
//! writable layer; committing it yields an immutable snapshot that can be
//! the parent of further layers. Views are read-only layers that are never
//! committed.
//!
//! Records live in the metadata store; the backend owns the layer
//! directories, one per record, named by the record's id.

mod backend;
mod changeset;
mod mount;

pub use backend::BackendKind;
pub use changeset::{Changes, WHITEOUT_PREFIX};
pub use mount::{Mount, MountType};

pub(crate) use backend::usage_of;

use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::metadata::{Db, KeyLocks, Kind, Resource, SnapshotRecord, Tables, Usage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum snapshot key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Public view of a snapshot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub kind: Kind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    /// Present for committed snapshots.
    pub usage: Option<Usage>,
}

impl SnapshotInfo {
    fn from_record(key: &str, record: &SnapshotRecord) -> Self {
        Self {
            key: key.to_string(),
            parent: record.parent.clone(),
            kind: record.kind,
            created_at: record.created_at,
            updated_at: record.updated_at,
            labels: record.labels.clone(),
            usage: record.usage,
        }
    }
}

/// Snapshot manager over a single backend.
#[derive(Debug)]
pub struct Snapshotter {
    root: PathBuf,
    db: Arc<Db>,
    backend: BackendKind,
    inflight: KeyLocks,
}

impl Snapshotter {
    /// Open the snapshotter rooted at `root`, creating the directory.
    pub fn open<P: AsRef<Path>>(root: P, db: Arc<Db>, backend: BackendKind) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            db,
            backend,
            inflight: KeyLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    fn layer_dir(&self, id: u64) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Create a writable snapshot `key` on top of the committed `parent`.
    pub fn prepare(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.prepare_with(key, parent, &Cancel::new())
    }

    /// [`prepare`](Self::prepare) with cancellation.
    ///
    /// A cancelled prepare removes its partial layer and leaves no record.
    pub fn prepare_with(&self, key: &str, parent: Option<&str>, cancel: &Cancel) -> Result<Vec<Mount>> {
        self.create(Kind::Active, key, parent, cancel)
    }

    /// Create a read-only snapshot `key` of the committed `parent`.
    pub fn view(&self, key: &str, parent: Option<&str>) -> Result<Vec<Mount>> {
        self.create(Kind::View, key, parent, &Cancel::new())
    }

    fn create(&self, kind: Kind, key: &str, parent: Option<&str>, cancel: &Cancel) -> Result<Vec<Mount>> {
        validate_key(key)?;
        let _sweep = self.db.shared()?;
        let _claim = self
            .inflight
            .try_lock(key)?
            .ok_or_else(|| Error::already_exists("snapshot", key))?;

        let (id, chain) = self.db.update(|tables| {
            if tables.snapshots.contains_key(key) {
                return Err(Error::already_exists("snapshot", key));
            }
            let chain = match parent {
                Some(parent) => parent_chain(tables, parent)?,
                None => Vec::new(),
            };
            Ok((tables.allocate_id(), chain))
        })?;

        let layer = self.layer_dir(id);
        let parents: Vec<PathBuf> = chain.iter().map(|id| self.layer_dir(*id)).collect();

        let created = self
            .backend
            .prepare(&layer, &parents, kind, cancel)
            .and_then(|()| {
                let now = Utc::now();
                self.db.update(|tables| {
                    if tables.snapshots.contains_key(key) {
                        return Err(Error::already_exists("snapshot", key));
                    }
                    tables.snapshots.insert(
                        key.to_string(),
                        SnapshotRecord {
                            id,
                            kind,
                            parent: parent.map(str::to_string),
                            created_at: now,
                            updated_at: now,
                            labels: BTreeMap::new(),
                            usage: None,
                        },
                    );
                    Ok(())
                })
            });

        if let Err(e) = created {
            if let Err(cleanup) = self.backend.remove(&layer) {
                warn!(key, id, error = %cleanup, "failed to remove partial layer");
            }
            return Err(e);
        }

        debug!(key, id, kind = %kind, parent = ?parent, "created snapshot");
        Ok(self.backend.mounts(&layer, &parents, kind))
    }

    /// Freeze the active snapshot `active_key` as the committed snapshot `key`.
    ///
    /// The active key ceases to exist. Lease pins and root labels naming it
    /// are moved to `key`.
    pub fn commit(&self, active_key: &str, key: &str) -> Result<SnapshotInfo> {
        validate_key(key)?;
        if key == active_key {
            return Err(Error::already_exists("snapshot", key));
        }
        let _sweep = self.db.shared()?;
        let _claim = self
            .inflight
            .try_lock(key)?
            .ok_or_else(|| Error::already_exists("snapshot", key))?;
        let _active = self
            .inflight
            .try_lock(active_key)?
            .ok_or_else(|| Error::invalid_state(active_key, "snapshot is busy"))?;

        let id = self.db.view(|tables| {
            let record = active_record(tables, active_key)?;
            if tables.snapshots.contains_key(key) {
                return Err(Error::already_exists("snapshot", key));
            }
            Ok(record.id)
        })?;

        let layer = self.layer_dir(id);
        let usage = usage_of(&backend::fs_dir(&layer))?;

        let now = Utc::now();
        let record = self.db.update(|tables| {
            let mut record = active_record(tables, active_key)?.clone();
            if tables.snapshots.contains_key(key) {
                return Err(Error::already_exists("snapshot", key));
            }
            tables.snapshots.remove(active_key);

            record.kind = Kind::Committed;
            record.updated_at = now;
            record.usage = Some(usage);
            tables.snapshots.insert(key.to_string(), record.clone());

            let from = Resource::Snapshot(active_key.to_string());
            let to = Resource::Snapshot(key.to_string());
            for lease in tables.leases.values_mut() {
                if lease.pins.remove(&from) {
                    lease.pins.insert(to.clone());
                }
            }
            for pinned in tables.roots.values_mut() {
                if *pinned == from {
                    *pinned = to.clone();
                }
            }
            Ok(record)
        })?;

        if let Err(e) = self.backend.commit(&layer) {
            warn!(key, id, error = %e, "failed to finalize committed layer");
        }

        info!(
            key,
            active_key,
            id,
            size = usage.size,
            inodes = usage.inodes,
            "committed snapshot"
        );
        Ok(SnapshotInfo::from_record(key, &record))
    }

    /// Remove snapshot `key`.
    ///
    /// Fails with `InUse` while it has children or is pinned by a live lease
    /// or a root label.
    pub fn remove(&self, key: &str) -> Result<()> {
        let _sweep = self.db.exclusive()?;
        let now = Utc::now();

        let id = self.db.update(|tables| {
            let record = tables
                .snapshots
                .get(key)
                .ok_or_else(|| Error::not_found("snapshot", key))?;
            let id = record.id;

            let children: Vec<&str> = tables.children_of(key).map(String::as_str).collect();
            if !children.is_empty() {
                return Err(Error::in_use(
                    key,
                    format!("has child snapshots: {}", children.join(", ")),
                ));
            }

            let pins = tables.pinned_by(&Resource::Snapshot(key.to_string()), now);
            if !pins.is_empty() {
                return Err(Error::in_use(key, format!("pinned by {}", pins.join(", "))));
            }

            tables.snapshots.remove(key);
            Ok(id)
        })?;

        // The record is gone; a leftover layer is an orphan for GC.
        if let Err(e) = self.backend.remove(&self.layer_dir(id)) {
            warn!(key, id, error = %e, "failed to remove snapshot layer");
        }

        debug!(key, id, "removed snapshot");
        Ok(())
    }

    /// Information about snapshot `key`.
    pub fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        self.db.view(|tables| {
            tables
                .snapshots
                .get(key)
                .map(|record| SnapshotInfo::from_record(key, record))
                .ok_or_else(|| Error::not_found("snapshot", key))
        })
    }

    /// All snapshots, ordered by key.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        self.db.view(|tables| {
            Ok(tables
                .snapshots
                .iter()
                .map(|(key, record)| SnapshotInfo::from_record(key, record))
                .collect())
        })
    }

    /// Call `f` for every snapshot, ordered by key.
    ///
    /// Runs over a point-in-time listing, so `f` may call back into the
    /// snapshotter.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&SnapshotInfo) -> Result<()>,
    {
        for info in self.list()? {
            f(&info)?;
        }
        Ok(())
    }

    /// Mounts of an active snapshot or view.
    pub fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let (record, chain) = self.db.view(|tables| {
            let record = tables
                .snapshots
                .get(key)
                .ok_or_else(|| Error::not_found("snapshot", key))?;
            if record.kind == Kind::Committed {
                return Err(Error::invalid_state(
                    key,
                    "committed snapshots have no mounts; create a view",
                ));
            }
            let chain = match &record.parent {
                Some(parent) => parent_chain(tables, parent)?,
                None => Vec::new(),
            };
            Ok((record.clone(), chain))
        })?;

        let parents: Vec<PathBuf> = chain.iter().map(|id| self.layer_dir(*id)).collect();
        Ok(self
            .backend
            .mounts(&self.layer_dir(record.id), &parents, record.kind))
    }

    /// Disk usage of snapshot `key`'s own layer.
    ///
    /// Committed snapshots report the usage measured at commit.
    pub fn usage(&self, key: &str) -> Result<Usage> {
        let record = self.db.view(|tables| {
            tables
                .snapshots
                .get(key)
                .cloned()
                .ok_or_else(|| Error::not_found("snapshot", key))
        })?;

        match record.usage {
            Some(usage) => Ok(usage),
            None => usage_of(&backend::fs_dir(&self.layer_dir(record.id))),
        }
    }

    /// Replace the labels of snapshot `key`.
    pub fn update_labels(&self, key: &str, labels: BTreeMap<String, String>) -> Result<SnapshotInfo> {
        let now = Utc::now();
        self.db.update(|tables| {
            let record = tables
                .snapshots
                .get_mut(key)
                .ok_or_else(|| Error::not_found("snapshot", key))?;
            record.labels = labels;
            record.updated_at = now;
            Ok(SnapshotInfo::from_record(key, record))
        })
    }

    /// Write the changes from `lower` (or an empty tree) to `upper` as a tar
    /// changeset into `out`.
    pub fn write_changeset<W: Write>(
        &self,
        lower: Option<&str>,
        upper: &str,
        out: W,
        cancel: &Cancel,
    ) -> Result<(W, Changes)> {
        let _sweep = self.db.shared()?;
        let (lower_layers, upper_layers) = self.db.view(|tables| {
            let lower = match lower {
                Some(key) => self.layers_of(tables, key)?,
                None => Vec::new(),
            };
            Ok((lower, self.layers_of(tables, upper)?))
        })?;

        let lower_tree = changeset::merge_layers(&lower_layers, cancel)?;
        let upper_tree = changeset::merge_layers(&upper_layers, cancel)?;
        let (out, changes) = changeset::write(&lower_tree, &upper_tree, out, cancel)?;

        debug!(
            lower,
            upper,
            added = changes.added,
            modified = changes.modified,
            removed = changes.removed,
            "wrote changeset"
        );
        Ok((out, changes))
    }

    /// Unpack a tar changeset into the active snapshot `key`.
    pub fn apply_changeset<R: Read>(&self, key: &str, reader: R, cancel: &Cancel) -> Result<Changes> {
        let _sweep = self.db.shared()?;
        let _claim = self
            .inflight
            .try_lock(key)?
            .ok_or_else(|| Error::invalid_state(key, "snapshot is busy"))?;

        let (id, parents) = self.db.view(|tables| {
            let record = active_record(tables, key)?;
            let parents = match (&record.parent, self.backend) {
                (Some(parent), BackendKind::Overlay) => self.layers_of(tables, parent)?,
                _ => Vec::new(),
            };
            Ok((record.id, parents))
        })?;

        // Removals on an overlay layer must hide what the parents still hold
        let lower = match self.backend {
            BackendKind::Overlay => Some(changeset::merge_layers(&parents, cancel)?),
            BackendKind::Naive => None,
        };
        let target = backend::fs_dir(&self.layer_dir(id));
        let changes = changeset::apply(&target, reader, lower.as_ref(), cancel)?;

        debug!(
            key,
            id,
            added = changes.added,
            modified = changes.modified,
            removed = changes.removed,
            "applied changeset"
        );
        Ok(changes)
    }

    /// Layer `fs` directories that make up `key`'s contents, bottom first.
    fn layers_of(&self, tables: &Tables, key: &str) -> Result<Vec<PathBuf>> {
        let record = tables
            .snapshots
            .get(key)
            .ok_or_else(|| Error::not_found("snapshot", key))?;

        let mut ids = match (&record.parent, self.backend) {
            (Some(parent), BackendKind::Overlay) => parent_chain(tables, parent)?,
            _ => Vec::new(),
        };
        ids.reverse();
        ids.push(record.id);

        Ok(ids
            .into_iter()
            .map(|id| backend::fs_dir(&self.layer_dir(id)))
            .collect())
    }

    /// Delete the layer with `id`, returning the bytes freed.
    ///
    /// Only called from GC's sweep, after the record is gone.
    pub(crate) fn remove_layer(&self, id: u64) -> Result<u64> {
        let layer = self.layer_dir(id);
        let freed = usage_of(&layer)?.size;
        self.backend.remove(&layer)?;
        Ok(freed)
    }

    /// Layer directories whose id has no record.
    ///
    /// Only meaningful while the sweep lock is held exclusively.
    pub(crate) fn orphan_layers(&self, known: &HashSet<u64>) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok());
            match id {
                Some(id) if known.contains(&id) => {}
                _ => orphans.push(path),
            }
        }
        Ok(orphans)
    }
}

fn active_record<'a>(tables: &'a Tables, key: &str) -> Result<&'a SnapshotRecord> {
    let record = tables
        .snapshots
        .get(key)
        .ok_or_else(|| Error::not_found("snapshot", key))?;
    if record.kind != Kind::Active {
        return Err(Error::invalid_state(
            key,
            format!("snapshot is {}, not active", record.kind),
        ));
    }
    Ok(record)
}

/// Backend ids of `parent` and its ancestors, nearest first.
///
/// `parent` must exist and be committed.
fn parent_chain(tables: &Tables, parent: &str) -> Result<Vec<u64>> {
    let record = tables
        .snapshots
        .get(parent)
        .ok_or_else(|| Error::not_found("snapshot", parent))?;
    if record.kind != Kind::Committed {
        return Err(Error::invalid_state(
            parent,
            format!("parent is {}, not committed", record.kind),
        ));
    }

    let mut chain = vec![record.id];
    let mut next = record.parent.as_deref();
    while let Some(key) = next {
        let ancestor = tables
            .snapshots
            .get(key)
            .ok_or_else(|| Error::not_found("snapshot", key))?;
        chain.push(ancestor.id);
        next = ancestor.parent.as_deref();
    }
    Ok(chain)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key("Snapshot key cannot be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid_key(format!(
            "Snapshot key longer than {} bytes",
            MAX_KEY_LEN
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(Error::invalid_key(format!(
            "Snapshot key contains control characters: {:?}",
            key
        )));
    }
    Ok(())
}
