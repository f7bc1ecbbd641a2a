//! Garbage collection.
//!
//! Mark-and-sweep over snapshots and blobs. Roots are the root labels and
//! the pins of every live lease. From there marking follows snapshot parent
//! chains and reference labels:
//!
//! - `strata.gc.ref.content*` labels name a blob digest;
//! - `strata.gc.ref.snapshot*` labels name a snapshot key.
//!
//! Records of unmarked objects and expired leases are removed in the same
//! metadata transaction that computed the mark. Backend artifacts are
//! deleted afterwards; whatever fails to delete is reclaimed by the orphan
//! scan of a later pass.

use crate::digest::Digest;
use crate::error::Result;
use crate::metadata::{Resource, Tables};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Label prefix naming a referenced blob digest.
pub const REF_CONTENT_PREFIX: &str = "strata.gc.ref.content";
/// Label prefix naming a referenced snapshot key.
pub const REF_SNAPSHOT_PREFIX: &str = "strata.gc.ref.snapshot";

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Nothing was deleted; counts are what would have been.
    pub dry_run: bool,
    pub snapshots_deleted: usize,
    pub blobs_deleted: usize,
    pub leases_expired: usize,
    pub ingests_removed: usize,
    pub orphans_removed: usize,
    /// Bytes freed (estimated from records in a dry run).
    pub bytes_freed: u64,
    /// Objects whose records were removed, snapshots first.
    pub deleted: Vec<Resource>,
    pub failures: Vec<GcFailure>,
}

/// An artifact GC could not delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcFailure {
    pub object: String,
    pub error: String,
}

/// Objects reachable from the roots.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Marked {
    pub snapshots: HashSet<String>,
    pub blobs: HashSet<Digest>,
}

impl Marked {
    pub fn contains(&self, resource: &Resource) -> bool {
        match resource {
            Resource::Snapshot(key) => self.snapshots.contains(key),
            Resource::Content(digest) => self.blobs.contains(digest),
        }
    }
}

/// Compute the reachable set of `tables` at time `now`.
///
/// Pins and references to objects without a record are ignored.
pub fn mark(tables: &Tables, now: DateTime<Utc>) -> Marked {
    let mut marked = Marked::default();

    let mut worklist: Vec<Resource> = tables.roots.values().cloned().collect();
    for lease in tables.leases.values().filter(|l| !l.is_expired(now)) {
        worklist.extend(lease.pins.iter().cloned());
    }

    while let Some(resource) = worklist.pop() {
        match resource {
            Resource::Snapshot(key) => {
                let Some(record) = tables.snapshots.get(&key) else {
                    continue;
                };
                if !marked.snapshots.insert(key) {
                    continue;
                }
                if let Some(parent) = &record.parent {
                    worklist.push(Resource::Snapshot(parent.clone()));
                }
                worklist.extend(label_refs(&record.labels));
            }
            Resource::Content(digest) => {
                let Some(record) = tables.blobs.get(&digest) else {
                    continue;
                };
                if !marked.blobs.insert(digest) {
                    continue;
                }
                worklist.extend(label_refs(&record.labels));
            }
        }
    }

    marked
}

fn label_refs(labels: &BTreeMap<String, String>) -> impl Iterator<Item = Resource> + '_ {
    labels.iter().filter_map(|(key, value)| {
        if key.starts_with(REF_CONTENT_PREFIX) {
            Digest::parse(value).ok().map(Resource::Content)
        } else if key.starts_with(REF_SNAPSHOT_PREFIX) {
            Some(Resource::Snapshot(value.clone()))
        } else {
            None
        }
    })
}

/// What one pass removes.
#[derive(Debug, Default)]
struct Plan {
    /// (key, backend id, recorded size), children before parents.
    snapshots: Vec<(String, u64, u64)>,
    /// (digest, size)
    blobs: Vec<(Digest, u64)>,
    expired_leases: Vec<String>,
}

impl Plan {
    fn compute(tables: &Tables, now: DateTime<Utc>) -> Self {
        let marked = mark(tables, now);

        let mut snapshots: Vec<(usize, String, u64, u64)> = tables
            .snapshots
            .iter()
            .filter(|(key, _)| !marked.snapshots.contains(*key))
            .map(|(key, record)| {
                let size = record.usage.map(|u| u.size).unwrap_or(0);
                (depth(tables, key), key.clone(), record.id, size)
            })
            .collect();
        snapshots.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        Self {
            snapshots: snapshots
                .into_iter()
                .map(|(_, key, id, size)| (key, id, size))
                .collect(),
            blobs: tables
                .blobs
                .iter()
                .filter(|(digest, _)| !marked.blobs.contains(*digest))
                .map(|(digest, record)| (*digest, record.size))
                .collect(),
            expired_leases: tables
                .leases
                .iter()
                .filter(|(_, lease)| lease.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect(),
        }
    }

    fn apply(&self, tables: &mut Tables) {
        for id in &self.expired_leases {
            tables.leases.remove(id);
        }
        for (key, _, _) in &self.snapshots {
            tables.snapshots.remove(key);
        }
        for (digest, _) in &self.blobs {
            tables.blobs.remove(digest);
        }
    }
}

/// Number of ancestors of `key`.
fn depth(tables: &Tables, key: &str) -> usize {
    let mut depth = 0;
    let mut next = tables.snapshots.get(key).and_then(|r| r.parent.as_deref());
    while let Some(parent) = next {
        depth += 1;
        next = tables.snapshots.get(parent).and_then(|r| r.parent.as_deref());
    }
    depth
}

impl Worker {
    /// Run garbage collection.
    ///
    /// If `dry_run` is true, reports what would be deleted without deleting
    /// anything.
    pub fn gc(&self, dry_run: bool) -> Result<GcStats> {
        let started = Instant::now();
        let _sweep = self.db.exclusive()?;
        let now = Utc::now();

        let plan = if dry_run {
            self.db.view(|tables| Ok(Plan::compute(tables, now)))?
        } else {
            self.db.update(|tables| {
                let plan = Plan::compute(tables, now);
                plan.apply(tables);
                Ok(plan)
            })?
        };

        let mut stats = GcStats {
            dry_run,
            snapshots_deleted: plan.snapshots.len(),
            blobs_deleted: plan.blobs.len(),
            leases_expired: plan.expired_leases.len(),
            ..GcStats::default()
        };

        let mut kept_ids = HashSet::new();
        let mut kept_blobs = HashSet::new();

        for (key, id, size) in &plan.snapshots {
            stats.deleted.push(Resource::Snapshot(key.clone()));
            if dry_run {
                stats.bytes_freed += size;
                continue;
            }
            match self.snapshots.remove_layer(*id) {
                Ok(freed) => stats.bytes_freed += freed,
                Err(e) => {
                    kept_ids.insert(*id);
                    stats.fail(format!("snapshot/{}", key), &e);
                }
            }
        }

        for (digest, size) in &plan.blobs {
            stats.deleted.push(Resource::Content(*digest));
            if dry_run {
                stats.bytes_freed += size;
                continue;
            }
            match self.content.delete(digest) {
                Ok(freed) => stats.bytes_freed += freed,
                Err(e) => {
                    kept_blobs.insert(*digest);
                    stats.fail(format!("content/{}", digest), &e);
                }
            }
        }

        // Artifacts that just failed to delete are not retried as orphans.
        let tables = self.db.snapshot()?;
        kept_ids.extend(tables.snapshots.values().map(|r| r.id));
        kept_blobs.extend(tables.blobs.keys().copied());
        if dry_run {
            kept_ids.extend(plan.snapshots.iter().map(|(_, id, _)| *id));
            kept_blobs.extend(plan.blobs.iter().map(|(digest, _)| *digest));
        }

        let mut orphans = self.snapshots.orphan_layers(&kept_ids)?;
        orphans.extend(self.content.orphan_files(&kept_blobs)?);
        for path in orphans {
            debug!(path = %path.display(), dry_run, "orphaned artifact");
            if dry_run {
                stats.orphans_removed += 1;
                continue;
            }
            match remove_path(&path) {
                Ok(()) => stats.orphans_removed += 1,
                Err(e) => stats.fail(path.display().to_string(), &e),
            }
        }

        for ingest_ref in self.content.stale_ingests(self.policy().ingest_expiry)? {
            if dry_run {
                stats.ingests_removed += 1;
                continue;
            }
            match self.content.remove_ingest(&ingest_ref) {
                Ok(true) => stats.ingests_removed += 1,
                Ok(false) => {}
                Err(e) => stats.fail(format!("ingest/{}", ingest_ref), &e),
            }
        }

        info!(
            dry_run,
            snapshots = stats.snapshots_deleted,
            blobs = stats.blobs_deleted,
            leases = stats.leases_expired,
            ingests = stats.ingests_removed,
            orphans = stats.orphans_removed,
            bytes = stats.bytes_freed,
            failures = stats.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "garbage collection finished"
        );

        Ok(stats)
    }
}

impl GcStats {
    fn fail(&mut self, object: String, error: &dyn fmt::Display) {
        warn!(object = %object, error = %error, "failed to delete");
        self.failures.push(GcFailure {
            object,
            error: error.to_string(),
        });
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::metadata::{BlobRecord, Kind, LeaseRecord, SnapshotRecord};
    use std::io::Write;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> Worker {
        Worker::open(WorkerConfig::new(temp_dir.path()).snapshotter("naive")).unwrap()
    }

    fn snapshot(id: u64, parent: Option<&str>) -> SnapshotRecord {
        let now = Utc::now();
        SnapshotRecord {
            id,
            kind: Kind::Committed,
            parent: parent.map(str::to_string),
            created_at: now,
            updated_at: now,
            labels: BTreeMap::new(),
            usage: None,
        }
    }

    fn blob() -> BlobRecord {
        let now = Utc::now();
        BlobRecord {
            size: 1,
            created_at: now,
            updated_at: now,
            labels: BTreeMap::new(),
        }
    }

    fn put(worker: &Worker, data: &[u8]) -> Digest {
        let mut writer = worker.content().open_writer(None).unwrap();
        writer.write_all(data).unwrap();
        writer.commit(None).unwrap().digest
    }

    #[test]
    fn test_mark_follows_parents_and_labels() {
        let now = Utc::now();
        let layer = Digest::of_bytes(b"layer");
        let config = Digest::of_bytes(b"config");
        let stray = Digest::of_bytes(b"stray");

        let mut tables = Tables::default();
        tables.snapshots.insert("S1".into(), snapshot(1, None));
        let mut s2 = snapshot(2, Some("S1"));
        s2.labels
            .insert(format!("{}.layer", REF_CONTENT_PREFIX), layer.to_string());
        tables.snapshots.insert("S2".into(), s2);
        tables.snapshots.insert("S3".into(), snapshot(3, Some("S1")));

        let mut layer_record = blob();
        layer_record
            .labels
            .insert(format!("{}.config", REF_CONTENT_PREFIX), config.to_string());
        tables.blobs.insert(layer, layer_record);
        tables.blobs.insert(config, blob());
        tables.blobs.insert(stray, blob());

        tables
            .roots
            .insert("image".into(), Resource::Snapshot("S2".into()));

        let marked = mark(&tables, now);
        assert_eq!(
            marked.snapshots,
            ["S1", "S2"].into_iter().map(String::from).collect()
        );
        assert_eq!(marked.blobs, [layer, config].into_iter().collect());
    }

    #[test]
    fn test_mark_ignores_expired_leases_and_dangling_pins() {
        let now = Utc::now();
        let mut tables = Tables::default();
        tables.snapshots.insert("S1".into(), snapshot(1, None));
        tables.leases.insert(
            "old".into(),
            LeaseRecord {
                created_at: now,
                expires_at: Some(now - chrono::Duration::seconds(5)),
                labels: BTreeMap::new(),
                pins: [Resource::Snapshot("S1".into())].into_iter().collect(),
            },
        );
        tables.leases.insert(
            "new".into(),
            LeaseRecord {
                created_at: now,
                expires_at: None,
                labels: BTreeMap::new(),
                pins: [Resource::Snapshot("not-yet".into())].into_iter().collect(),
            },
        );

        assert_eq!(mark(&tables, now), Marked::default());
    }

    #[test]
    fn test_plan_orders_children_first() {
        let mut tables = Tables::default();
        tables.snapshots.insert("a".into(), snapshot(1, None));
        tables.snapshots.insert("b".into(), snapshot(2, Some("a")));
        tables.snapshots.insert("c".into(), snapshot(3, Some("b")));

        let plan = Plan::compute(&tables, Utc::now());
        let keys: Vec<&str> = plan.snapshots.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_gc_empty_worker() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats, GcStats::default());
    }

    #[test]
    fn test_gc_keeps_rooted_blob() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);

        let digest = put(&worker, b"test data");
        worker.set_root("keep", Resource::Content(digest)).unwrap();

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.blobs_deleted, 0);
        assert_eq!(worker.content().read(&digest).unwrap(), b"test data");
    }

    #[test]
    fn test_gc_unreferenced_blob() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);

        let digest = put(&worker, b"orphan data");
        let path = worker.content().blob_path(&digest);
        assert!(path.exists());

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.blobs_deleted, 1);
        assert!(stats.bytes_freed > 0);
        assert_eq!(stats.deleted, vec![Resource::Content(digest)]);
        assert!(!path.exists());
        assert!(worker.content().info(&digest).unwrap_err().is_not_found());
    }

    #[test]
    fn test_gc_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);

        let digest = put(&worker, b"orphan");
        worker.snapshots().prepare("L1", None).unwrap();

        let stats = worker.gc(true).unwrap();
        assert!(stats.dry_run);
        assert_eq!(stats.blobs_deleted, 1);
        assert_eq!(stats.snapshots_deleted, 1);
        assert_eq!(stats.orphans_removed, 0);

        // Nothing actually deleted
        assert!(worker.content().info(&digest).is_ok());
        assert!(worker.snapshots().stat("L1").is_ok());

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.blobs_deleted, 1);
        assert_eq!(stats.snapshots_deleted, 1);
    }

    #[test]
    fn test_gc_removes_expired_lease() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);

        let id = worker
            .leases()
            .create_with(Some(std::time::Duration::ZERO), BTreeMap::new())
            .unwrap();

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.leases_expired, 1);
        assert!(worker.leases().get(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_gc_orphan_scan() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);

        // Left behind by a crash before the record was written
        let layer = worker.snapshots().root().join("77");
        fs::create_dir_all(layer.join("fs")).unwrap();
        let digest = Digest::of_bytes(b"lost");
        let blob_path = worker.content().blob_path(&digest);
        fs::create_dir_all(blob_path.parent().unwrap()).unwrap();
        fs::write(&blob_path, b"lost").unwrap();

        let stats = worker.gc(true).unwrap();
        assert_eq!(stats.orphans_removed, 2);
        assert!(layer.exists());

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.orphans_removed, 2);
        assert!(!layer.exists());
        assert!(!blob_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_gc_reports_failed_delete_and_reclaims_it_later() {
        use std::os::unix::fs::PermissionsExt;

        // Permission bits do not stop root
        if nix::unistd::geteuid().is_root() {
            return;
        }

        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);
        let snapshots = worker.snapshots();

        let mounts = snapshots.prepare("L1", None).unwrap();
        let stuck = mounts[0].writable_dir().unwrap().join("stuck");
        fs::create_dir(&stuck).unwrap();
        fs::write(stuck.join("file"), b"x").unwrap();
        snapshots.commit("L1", "S1").unwrap();
        fs::set_permissions(&stuck, fs::Permissions::from_mode(0o555)).unwrap();

        let mounts = snapshots.prepare("L2", None).unwrap();
        let other_layer = mounts[0].writable_dir().unwrap();
        snapshots.commit("L2", "S2").unwrap();
        let digest = put(&worker, b"unreferenced");
        let blob_path = worker.content().blob_path(&digest);

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.snapshots_deleted, 2);
        assert_eq!(stats.blobs_deleted, 1);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].object, "snapshot/S1");
        assert_eq!(stats.orphans_removed, 0, "failed deletes are not retried as orphans");
        assert!(!other_layer.exists());
        assert!(!blob_path.exists());
        assert!(stuck.exists());
        assert!(snapshots.list().unwrap().is_empty());

        fs::set_permissions(&stuck, fs::Permissions::from_mode(0o755)).unwrap();
        let stats = worker.gc(false).unwrap();
        assert!(stats.failures.is_empty());
        assert_eq!(stats.snapshots_deleted, 0);
        assert_eq!(stats.orphans_removed, 1);
        assert!(!stuck.exists());
        assert_eq!(fs::read_dir(snapshots.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_gc_removes_stale_ingests() {
        let temp_dir = TempDir::new().unwrap();
        let worker = Worker::open(
            WorkerConfig::new(temp_dir.path())
                .snapshotter("naive")
                .gc_policy(crate::config::GcPolicy {
                    ingest_expiry: std::time::Duration::ZERO,
                    ..Default::default()
                }),
        )
        .unwrap();

        let mut writer = worker.content().resume_writer("upload-1", None).unwrap();
        writer.write_all(b"partial").unwrap();
        // Simulate an interrupted upload: the data stays on disk
        std::mem::forget(writer);

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.ingests_removed, 0, "held by a live writer");

        // Abandoned by a previous process
        let dir = worker.content().root().join("ingest").join("upload-2");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("data"), b"partial").unwrap();

        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.ingests_removed, 1);
        assert!(!dir.exists());
    }
}
