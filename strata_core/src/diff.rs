//! Layer diffs stored as blobs.
//!
//! [`Worker::diff`] writes the changeset between two snapshots into the
//! content store and labels the upper snapshot with its digest, so the blob
//! stays alive as long as the snapshot does. [`Worker::apply`] unpacks such
//! a blob into an active snapshot.

use crate::cancel::Cancel;
use crate::content::Blob;
use crate::digest::Digest;
use crate::error::Result;
use crate::metadata::{Kind, Resource};
use crate::snapshot::Changes;
use crate::worker::Worker;
use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom};
use tracing::info;

/// Snapshot label naming the blob of its last computed diff.
pub const LABEL_DIFF: &str = "strata.gc.ref.content.diff";
/// Snapshot label naming the lower key of that diff, empty for none.
pub const LABEL_DIFF_LOWER: &str = "strata.diff.lower";

impl Worker {
    /// Store the changes from `lower` (or an empty tree) to `upper` as a blob.
    pub fn diff(&self, lower: Option<&str>, upper: &str) -> Result<Blob> {
        self.diff_with(lower, upper, &Cancel::new())
    }

    /// [`diff`](Self::diff) with cancellation.
    ///
    /// A committed upper that already carries a diff from the same lower
    /// returns the stored blob without walking the layers again.
    pub fn diff_with(&self, lower: Option<&str>, upper: &str, cancel: &Cancel) -> Result<Blob> {
        let info = self.snapshots.stat(upper)?;
        if let Some(blob) = self.cached_diff(&info.labels, info.kind, lower)? {
            return Ok(blob);
        }

        let lease = self.leases().guard()?;
        lease.pin(Resource::Snapshot(upper.to_string()))?;
        if let Some(lower) = lower {
            lease.pin(Resource::Snapshot(lower.to_string()))?;
        }

        let writer = self.content.open_writer(None)?;
        let (writer, changes) = self.snapshots.write_changeset(lower, upper, writer, cancel)?;
        lease.pin(Resource::Content(writer.digest()))?;
        let blob = writer.commit(None)?;

        let mut labels = self.snapshots.stat(upper)?.labels;
        labels.insert(LABEL_DIFF.to_string(), blob.digest.to_string());
        labels.insert(LABEL_DIFF_LOWER.to_string(), lower.unwrap_or("").to_string());
        self.snapshots.update_labels(upper, labels)?;
        lease.release()?;

        info!(
            lower,
            upper,
            digest = %blob.digest,
            size = blob.size,
            added = changes.added,
            modified = changes.modified,
            removed = changes.removed,
            "stored diff"
        );
        Ok(blob)
    }

    fn cached_diff(
        &self,
        labels: &BTreeMap<String, String>,
        kind: Kind,
        lower: Option<&str>,
    ) -> Result<Option<Blob>> {
        let same_lower = labels.get(LABEL_DIFF_LOWER).map(String::as_str) == Some(lower.unwrap_or(""));
        if kind != Kind::Committed || !same_lower {
            return Ok(None);
        }
        let Some(digest) = labels.get(LABEL_DIFF).and_then(|d| d.parse::<Digest>().ok()) else {
            return Ok(None);
        };
        match self.content.info(&digest) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Unpack the changeset blob `digest` into the active snapshot `key`.
    pub fn apply(&self, digest: &Digest, key: &str) -> Result<Changes> {
        self.apply_with(digest, key, &Cancel::new())
    }

    /// [`apply`](Self::apply) with cancellation.
    ///
    /// The blob is verified in full before anything is unpacked.
    pub fn apply_with(&self, digest: &Digest, key: &str, cancel: &Cancel) -> Result<Changes> {
        let mut staged = tempfile::tempfile_in(self.root())?;
        self.content.copy_to(digest, &mut staged)?;
        staged.seek(SeekFrom::Start(0))?;

        let changes = self.snapshots.apply_changeset(key, staged, cancel)?;
        info!(
            key,
            digest = %digest,
            added = changes.added,
            modified = changes.modified,
            removed = changes.removed,
            "applied diff"
        );
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::error::Error;
    use crate::gc::REF_CONTENT_PREFIX;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> Worker {
        Worker::open(WorkerConfig::new(temp_dir.path()).snapshotter("naive")).unwrap()
    }

    fn writable(worker: &Worker, key: &str, parent: Option<&str>) -> PathBuf {
        let mounts = worker.snapshots().prepare(key, parent).unwrap();
        mounts[0].writable_dir().unwrap()
    }

    fn entry_names(worker: &Worker, digest: &Digest) -> Vec<String> {
        let bytes = worker.content().read(digest).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    /// S1 holds a, c and dir/b; S2 edits a, drops c and dir, adds d.
    fn two_layers(worker: &Worker) {
        let l1 = writable(worker, "L1", None);
        fs::write(l1.join("a"), b"one").unwrap();
        fs::write(l1.join("c"), b"c").unwrap();
        fs::create_dir(l1.join("dir")).unwrap();
        fs::write(l1.join("dir/b"), b"b").unwrap();
        worker.snapshots().commit("L1", "S1").unwrap();

        let l2 = writable(worker, "L2", Some("S1"));
        fs::write(l2.join("a"), b"two").unwrap();
        fs::remove_file(l2.join("c")).unwrap();
        fs::remove_dir_all(l2.join("dir")).unwrap();
        fs::write(l2.join("d"), b"d").unwrap();
        worker.snapshots().commit("L2", "S2").unwrap();
    }

    #[test]
    fn test_diff_labels_upper_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);
        two_layers(&worker);

        let blob = worker.diff(Some("S1"), "S2").unwrap();
        assert!(LABEL_DIFF.starts_with(REF_CONTENT_PREFIX));
        assert_eq!(
            entry_names(&worker, &blob.digest),
            vec![".wh.c", ".wh.dir", "a", "d"]
        );

        let labels = worker.snapshots().stat("S2").unwrap().labels;
        assert_eq!(labels[LABEL_DIFF], blob.digest.to_string());
        assert_eq!(labels[LABEL_DIFF_LOWER], "S1");

        // The label keeps the blob alive while S2 is rooted
        worker
            .set_root("image", Resource::Snapshot("S2".into()))
            .unwrap();
        let stats = worker.gc(false).unwrap();
        assert_eq!(stats.blobs_deleted, 0);
        assert!(worker.content().exists(&blob.digest).unwrap());
        assert!(worker.leases().list().unwrap().is_empty());
    }

    #[test]
    fn test_diff_of_committed_snapshot_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);
        two_layers(&worker);

        let first = worker.diff(Some("S1"), "S2").unwrap();
        let again = worker.diff(Some("S1"), "S2").unwrap();
        assert_eq!(first.digest, again.digest);
        assert_eq!(first.created_at, again.created_at);

        // A different lower is a different diff
        let full = worker.diff(None, "S2").unwrap();
        assert_ne!(full.digest, first.digest);
        assert_eq!(entry_names(&worker, &full.digest), vec!["a", "d"]);
        assert_eq!(
            worker.snapshots().stat("S2").unwrap().labels[LABEL_DIFF_LOWER],
            ""
        );
    }

    #[test]
    fn test_apply_rebuilds_upper_on_lower() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);
        two_layers(&worker);
        let blob = worker.diff(Some("S1"), "S2").unwrap();

        let l3 = writable(&worker, "L3", Some("S1"));
        let changes = worker.apply(&blob.digest, "L3").unwrap();
        assert_eq!(
            changes,
            Changes {
                added: 1,
                modified: 1,
                removed: 2
            }
        );

        assert_eq!(fs::read(l3.join("a")).unwrap(), b"two");
        assert_eq!(fs::read(l3.join("d")).unwrap(), b"d");
        assert!(!l3.join("c").exists());
        assert!(!l3.join("dir").exists());

        // Committed, the rebuilt layer has nothing left to add over S2
        worker.snapshots().commit("L3", "S3").unwrap();
        let rest = worker.diff(Some("S2"), "S3").unwrap();
        assert!(entry_names(&worker, &rest.digest).is_empty());
    }

    #[test]
    fn test_diff_of_active_snapshot_is_recomputed() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);
        let dir = writable(&worker, "L1", None);
        fs::write(dir.join("x"), b"x").unwrap();

        let first = worker.diff(None, "L1").unwrap();
        fs::write(dir.join("y"), b"y").unwrap();
        let second = worker.diff(None, "L1").unwrap();

        assert_ne!(first.digest, second.digest);
        assert_eq!(entry_names(&worker, &second.digest), vec!["x", "y"]);
    }

    #[test]
    fn test_apply_errors() {
        let temp_dir = TempDir::new().unwrap();
        let worker = open(&temp_dir);
        two_layers(&worker);
        let blob = worker.diff(Some("S1"), "S2").unwrap();

        let result = worker.apply(&blob.digest, "S2");
        assert!(matches!(result, Err(Error::InvalidState { .. })));

        let result = worker.apply(&blob.digest, "missing");
        assert!(matches!(result, Err(Error::NotFound { .. })));

        writable(&worker, "L3", Some("S1"));
        let absent = Digest::of_bytes(b"not stored");
        let result = worker.apply(&absent, "L3");
        assert!(matches!(result, Err(Error::NotFound { .. })));

        let result = worker.diff(None, "missing");
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
