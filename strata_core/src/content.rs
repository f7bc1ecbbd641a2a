//! Content-addressable blob storage with streaming, resumable ingestion.
//!
//! Layout under the content root:
//!
//! ```text
//! content/
//! ├── blobs/blake3-256/<prefix>/<suffix>   # committed blob files
//! └── ingest/<ref>/data                    # in-progress writes
//! ```
//!
//! A blob exists once its metadata record exists. Blob files without a
//! record (left behind by a crash between persisting the file and writing
//! the record) are invisible and reclaimed by GC.

use crate::blobfile::{self, BlobHeader};
use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{Error, Result};
use crate::metadata::{BlobRecord, Db, KeyGuard, KeyLocks};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const BLOBS_DIR: &str = "blobs";
const INGEST_DIR: &str = "ingest";
const INGEST_DATA: &str = "data";

/// A committed blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blob {
    pub digest: Digest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

impl Blob {
    fn from_record(digest: Digest, record: &BlobRecord) -> Self {
        Self {
            digest,
            size: record.size,
            created_at: record.created_at,
            updated_at: record.updated_at,
            labels: record.labels.clone(),
        }
    }
}

/// State of an in-progress ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStatus {
    pub ingest_ref: String,
    pub offset: u64,
    /// Held by a live writer in this process.
    pub active: bool,
}

/// Content-addressable blob store.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    db: Arc<Db>,
    ingests: KeyLocks,
}

impl ContentStore {
    /// Open the content store rooted at `root`, creating its directories.
    pub fn open<P: AsRef<Path>>(root: P, db: Arc<Db>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOBS_DIR).join(Algorithm::Blake3.as_str()))?;
        fs::create_dir_all(root.join(INGEST_DIR))?;

        Ok(Self {
            root,
            db,
            ingests: KeyLocks::new(),
        })
    }

    /// Get the root directory of the content store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to a blob file given its digest.
    ///
    /// Returns: `blobs/{algorithm}/{prefix}/{suffix}`
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.prefix()).join(digest.suffix())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR).join(Algorithm::Blake3.as_str())
    }

    fn ingest_dir(&self, ingest_ref: &str) -> PathBuf {
        self.root.join(INGEST_DIR).join(ingest_ref)
    }

    /// Begin a streaming ingestion under a fresh ingest ref.
    ///
    /// Fails with `AlreadyExists` if `expected` is already committed; the
    /// caller can skip the write.
    pub fn open_writer(&self, expected: Option<Digest>) -> Result<Writer<'_>> {
        let ingest_ref = uuid::Uuid::new_v4().to_string();
        self.resume_writer(&ingest_ref, expected)
    }

    /// Open or resume an ingestion under `ingest_ref`.
    ///
    /// Bytes left on disk by an interrupted writer with the same ref are kept
    /// and re-digested; writing continues at their end.
    pub fn resume_writer(&self, ingest_ref: &str, expected: Option<Digest>) -> Result<Writer<'_>> {
        validate_ingest_ref(ingest_ref)?;

        if let Some(digest) = expected
            && self.exists(&digest)?
        {
            return Err(Error::already_exists("content", digest.to_string()));
        }

        let guard = self.ingests.try_lock(ingest_ref)?.ok_or_else(|| {
            Error::invalid_state(ingest_ref, "ingest ref is held by another writer")
        })?;

        let dir = self.ingest_dir(ingest_ref);
        fs::create_dir_all(&dir)?;
        let data_path = dir.join(INGEST_DATA);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)?;

        let mut digester = Digester::new();
        io::copy(&mut File::open(&data_path)?, &mut digester)?;

        if digester.is_empty() {
            debug!(ingest_ref, "opened content writer");
        } else {
            debug!(ingest_ref, offset = digester.len(), "resumed content writer");
        }

        Ok(Writer {
            store: self,
            guard,
            dir,
            data_path,
            file,
            digester,
            expected,
            done: false,
        })
    }

    /// Whether a blob with this digest is committed.
    pub fn exists(&self, digest: &Digest) -> Result<bool> {
        self.db.view(|tables| Ok(tables.blobs.contains_key(digest)))
    }

    /// Get the record of a committed blob.
    pub fn info(&self, digest: &Digest) -> Result<Blob> {
        self.db.view(|tables| {
            tables
                .blobs
                .get(digest)
                .map(|record| Blob::from_record(*digest, record))
                .ok_or_else(|| Error::not_found("content", digest.to_string()))
        })
    }

    /// On-disk header of a committed blob.
    pub fn header(&self, digest: &Digest) -> Result<BlobHeader> {
        self.info(digest)?;
        blobfile::read_header(&self.blob_path(digest))
    }

    /// Read a committed blob's bytes.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        // Existence is defined by the record, not the file
        self.info(digest)?;
        blobfile::read(&self.blob_path(digest), digest)
    }

    /// Stream a committed blob's bytes to `writer`, returning the byte count.
    ///
    /// The digest is checked once the last byte has been written; a
    /// `CorruptedObject` error means the output must be discarded.
    pub fn copy_to<W: Write>(&self, digest: &Digest, writer: W) -> Result<u64> {
        self.info(digest)?;
        blobfile::copy_verified(&self.blob_path(digest), digest, writer)
    }

    /// All committed blobs, ordered by digest.
    pub fn list(&self) -> Result<Vec<Blob>> {
        self.db.view(|tables| {
            Ok(tables
                .blobs
                .iter()
                .map(|(digest, record)| Blob::from_record(*digest, record))
                .collect())
        })
    }

    /// Visit every committed blob.
    ///
    /// Runs over a point-in-time copy, so `f` may call back into the store.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Blob) -> Result<()>,
    {
        for blob in self.list()? {
            f(&blob)?;
        }
        Ok(())
    }

    /// Replace the labels of a committed blob.
    pub fn update_labels(&self, digest: &Digest, labels: BTreeMap<String, String>) -> Result<Blob> {
        self.db.update(|tables| {
            let record = tables
                .blobs
                .get_mut(digest)
                .ok_or_else(|| Error::not_found("content", digest.to_string()))?;
            record.labels = labels;
            record.updated_at = Utc::now();
            Ok(Blob::from_record(*digest, record))
        })
    }

    /// In-progress ingestions found on disk.
    pub fn ingests(&self) -> Result<Vec<IngestStatus>> {
        let mut statuses = Vec::new();
        for entry in fs::read_dir(self.root.join(INGEST_DIR))? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let offset = fs::metadata(entry.path().join(INGEST_DATA))
                .map(|m| m.len())
                .unwrap_or(0);
            statuses.push(IngestStatus {
                active: self.ingests.is_locked(&name),
                ingest_ref: name,
                offset,
            });
        }
        statuses.sort_by(|a, b| a.ingest_ref.cmp(&b.ingest_ref));
        Ok(statuses)
    }

    /// Remove a blob file, returning the bytes freed.
    ///
    /// Only called from GC's sweep, after the record is gone.
    pub(crate) fn delete(&self, digest: &Digest) -> Result<u64> {
        let path = self.blob_path(digest);
        let freed = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;

        if let Some(shard) = path.parent()
            && let Ok(mut entries) = fs::read_dir(shard)
            && entries.next().is_none()
        {
            let _ = fs::remove_dir(shard);
        }

        Ok(freed)
    }

    /// Files under the blobs directory with no metadata record.
    ///
    /// Includes temp files from interrupted commits. Only meaningful while the
    /// sweep lock is held exclusively.
    pub(crate) fn orphan_files(&self, known: &HashSet<Digest>) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        let blobs_dir = self.blobs_dir();

        for shard_entry in fs::read_dir(&blobs_dir)? {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                orphans.push(shard_path);
                continue;
            }

            let prefix = shard_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();

            for obj_entry in fs::read_dir(&shard_path)? {
                let obj_path = obj_entry?.path();
                let suffix = obj_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                match Digest::from_hex(&format!("{}{}", prefix, suffix)) {
                    Ok(digest) if known.contains(&digest) => {}
                    _ => orphans.push(obj_path),
                }
            }
        }

        Ok(orphans)
    }

    /// Ingest refs not held by a writer whose data is older than `expiry`.
    pub(crate) fn stale_ingests(&self, expiry: Duration) -> Result<Vec<String>> {
        let now = SystemTime::now();
        let mut stale = Vec::new();

        for status in self.ingests()? {
            if status.active {
                continue;
            }
            let dir = self.ingest_dir(&status.ingest_ref);
            // Committed or aborted since listing
            let Ok(modified) = fs::metadata(dir.join(INGEST_DATA))
                .or_else(|_| fs::metadata(&dir))
                .and_then(|m| m.modified())
            else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= expiry {
                stale.push(status.ingest_ref);
            }
        }

        Ok(stale)
    }

    /// Remove an abandoned ingestion unless a writer has claimed it.
    pub(crate) fn remove_ingest(&self, ingest_ref: &str) -> Result<bool> {
        let Some(_guard) = self.ingests.try_lock(ingest_ref)? else {
            return Ok(false);
        };
        remove_dir_if_exists(&self.ingest_dir(ingest_ref))?;
        Ok(true)
    }
}

/// A streaming ingestion into the content store.
///
/// Dropping a writer without committing aborts it.
#[derive(Debug)]
pub struct Writer<'a> {
    store: &'a ContentStore,
    guard: KeyGuard<'a>,
    dir: PathBuf,
    data_path: PathBuf,
    file: File,
    digester: Digester,
    expected: Option<Digest>,
    done: bool,
}

impl Writer<'_> {
    /// The ingest ref this writer holds.
    pub fn ingest_ref(&self) -> &str {
        self.guard.key()
    }

    /// Bytes written so far, including resumed bytes.
    pub fn offset(&self) -> u64 {
        self.digester.len()
    }

    /// Digest of the bytes written so far.
    pub fn digest(&self) -> Digest {
        self.digester.finish()
    }

    /// Finalize the ingestion.
    ///
    /// The computed digest is checked against `expected`, falling back to the
    /// digest given when the writer was opened. A mismatch discards the data.
    /// Committing bytes that are already stored returns the existing blob.
    pub fn commit(mut self, expected: Option<Digest>) -> Result<Blob> {
        self.file.flush()?;
        self.file.sync_all()?;

        let actual = self.digester.finish();
        let size = self.digester.len();

        if let Some(expected) = expected.or(self.expected)
            && expected != actual
        {
            self.discard()?;
            debug!(%expected, %actual, "discarded ingestion on digest mismatch");
            return Err(Error::digest_mismatch(expected.to_string(), actual.to_string()));
        }

        let store = self.store;
        let _shared = store.db.shared()?;

        if let Ok(existing) = store.info(&actual) {
            self.discard()?;
            debug!(digest = %actual, "content already committed");
            return Ok(existing);
        }

        blobfile::persist(&self.data_path, &store.blob_path(&actual), size)?;

        let now = Utc::now();
        let blob = store.db.update(|tables| {
            let record = tables.blobs.entry(actual).or_insert_with(|| BlobRecord {
                size,
                created_at: now,
                updated_at: now,
                labels: BTreeMap::new(),
            });
            Ok(Blob::from_record(actual, record))
        })?;

        self.discard()?;
        info!(digest = %actual, size, "committed content");
        Ok(blob)
    }

    /// Abandon the ingestion and remove its partial data.
    pub fn abort(mut self) -> Result<()> {
        debug!(ingest_ref = self.ingest_ref(), "aborted content writer");
        self.discard()
    }

    fn discard(&mut self) -> Result<()> {
        self.done = true;
        remove_dir_if_exists(&self.dir)
    }
}

impl Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = remove_dir_if_exists(&self.dir);
        }
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Ingest refs become directory names, so no path traversal.
fn validate_ingest_ref(ingest_ref: &str) -> Result<()> {
    if ingest_ref.is_empty() {
        return Err(Error::invalid_key("Ingest ref cannot be empty"));
    }

    if ingest_ref.len() > 255
        || ingest_ref == "."
        || ingest_ref.contains("..")
        || !ingest_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::invalid_key(format!(
            "Invalid ingest ref: {} (allowed: A-Z a-z 0-9 - _ .)",
            ingest_ref
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobfile::CompressionType;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> ContentStore {
        let db = Arc::new(Db::open(temp_dir.path().join("metadata.json")).unwrap());
        ContentStore::open(temp_dir.path().join("content"), db).unwrap()
    }

    fn ingest(store: &ContentStore, data: &[u8]) -> Blob {
        let mut writer = store.open_writer(None).unwrap();
        writer.write_all(data).unwrap();
        writer.commit(None).unwrap()
    }

    #[test]
    fn test_write_commit_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let blob = ingest(&store, b"hello world");
        assert_eq!(blob.digest, Digest::of_bytes(b"hello world"));
        assert_eq!(blob.size, 11);

        assert_eq!(store.read(&blob.digest).unwrap(), b"hello world");
        assert!(store.blob_path(&blob.digest).exists());
        assert!(store.ingests().unwrap().is_empty());
    }

    #[test]
    fn test_large_blobs_are_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let small = ingest(&store, b"tiny");
        let large = ingest(&store, &vec![b'a'; 64 * 1024]);

        let header = store.header(&small.digest).unwrap();
        assert_eq!(header.compression, CompressionType::None);
        assert_eq!(header.payload_len, 4);

        let header = store.header(&large.digest).unwrap();
        assert_eq!(header.compression, CompressionType::Zstd);
        assert!(header.payload_len < large.size);
        assert_eq!(store.read(&large.digest).unwrap().len(), 64 * 1024);
    }

    #[test]
    fn test_streaming_writes() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let mut writer = store.open_writer(None).unwrap();
        writer.write_all(b"layer ").unwrap();
        writer.write_all(b"bytes").unwrap();
        assert_eq!(writer.offset(), 11);
        assert_eq!(writer.digest(), Digest::of_bytes(b"layer bytes"));
        let blob = writer.commit(Some(Digest::of_bytes(b"layer bytes"))).unwrap();

        let mut out = Vec::new();
        assert_eq!(store.copy_to(&blob.digest, &mut out).unwrap(), 11);
        assert_eq!(out, b"layer bytes");
    }

    #[test]
    fn test_commit_same_bytes_twice_stores_one_blob() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let first = ingest(&store, b"same content");
        let second = ingest(&store, b"same content");

        assert_eq!(first, second);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_open_writer_for_committed_digest() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let blob = ingest(&store, b"present");
        let err = store.open_writer(Some(blob.digest)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_digest_mismatch_discards_data() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let claimed = Digest::of_bytes(b"what the caller expected");

        let mut writer = store.open_writer(Some(claimed)).unwrap();
        writer.write_all(b"what actually arrived").unwrap();
        let err = writer.commit(None).unwrap_err();

        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(store.info(&claimed).unwrap_err().is_not_found());
        assert!(
            store
                .info(&Digest::of_bytes(b"what actually arrived"))
                .unwrap_err()
                .is_not_found()
        );
        assert!(store.ingests().unwrap().is_empty());
    }

    #[test]
    fn test_abort_and_drop_remove_partial_data() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let mut writer = store.resume_writer("aborted", None).unwrap();
        writer.write_all(b"partial").unwrap();
        writer.abort().unwrap();
        assert!(store.ingests().unwrap().is_empty());

        {
            let mut writer = store.resume_writer("dropped", None).unwrap();
            writer.write_all(b"partial").unwrap();
        }
        assert!(store.ingests().unwrap().is_empty());
    }

    #[test]
    fn test_resume_continues_at_offset() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        // Simulate a writer that died after writing half the bytes
        let dir = store.ingest_dir("layer-1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INGEST_DATA), b"first half, ").unwrap();

        let mut writer = store.resume_writer("layer-1", None).unwrap();
        assert_eq!(writer.offset(), 12);
        writer.write_all(b"second half").unwrap();
        let blob = writer.commit(None).unwrap();

        assert_eq!(store.read(&blob.digest).unwrap(), b"first half, second half");
    }

    #[test]
    fn test_ingest_ref_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let _writer = store.resume_writer("busy", None).unwrap();
        let err = store.resume_writer("busy", None).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let statuses = store.ingests().unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].active);
    }

    #[test]
    fn test_invalid_ingest_refs() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        assert!(store.resume_writer("", None).is_err());
        assert!(store.resume_writer("../escape", None).is_err());
        assert!(store.resume_writer("a/b", None).is_err());
    }

    #[test]
    fn test_get_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let digest = Digest::of_bytes(b"nonexistent");
        assert!(store.info(&digest).unwrap_err().is_not_found());
        assert!(store.read(&digest).unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_labels() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let blob = ingest(&store, b"labelled");

        let labels: BTreeMap<_, _> = [("origin".to_string(), "registry".to_string())]
            .into_iter()
            .collect();
        let updated = store.update_labels(&blob.digest, labels.clone()).unwrap();
        assert_eq!(updated.labels, labels);
        assert_eq!(store.info(&blob.digest).unwrap().labels, labels);
    }

    #[test]
    fn test_orphan_files_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let blob = ingest(&store, b"tracked");

        // A file persisted right before a crash, with no record
        let stray = Digest::of_bytes(b"stray");
        let stray_path = store.blob_path(&stray);
        fs::create_dir_all(stray_path.parent().unwrap()).unwrap();
        fs::write(&stray_path, b"junk").unwrap();

        let known: HashSet<Digest> = [blob.digest].into_iter().collect();
        assert_eq!(store.orphan_files(&known).unwrap(), vec![stray_path]);

        assert!(store.delete(&blob.digest).unwrap() > 0);
        assert!(!store.blob_path(&blob.digest).exists());
        assert_eq!(store.delete(&blob.digest).unwrap(), 0);
    }

    #[test]
    fn test_stale_ingests_skip_active_writers() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let dir = store.ingest_dir("abandoned");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INGEST_DATA), b"x").unwrap();
        let _live = store.resume_writer("live", None).unwrap();

        let stale = store.stale_ingests(Duration::ZERO).unwrap();
        assert_eq!(stale, vec!["abandoned".to_string()]);

        assert!(store.remove_ingest("abandoned").unwrap());
        assert!(!store.remove_ingest("live").unwrap());
    }
}
