//! # Strata Core
//!
//! Snapshot and content storage for build workers.
//!
//! A [`Worker`] ties together a transactional metadata store, a
//! content-addressable blob store, a layered snapshotter and a lease
//! tracker. Garbage collection reclaims every snapshot and blob that is not
//! reachable from a root label or a live lease.
//!
//! ## Features
//!
//! - Content-addressed blobs (BLAKE3) with streaming, resumable ingestion
//! - Active, committed and view snapshots over an overlayfs or naive backend
//! - Leases that pin objects for the duration of a build step
//! - Layer diffs stored as tar changesets, and applied back onto snapshots
//! - Mark-and-sweep GC with dry runs and orphan recovery
//!
//! ## Example
//!
//! ```no_run
//! use strata_core::{Resource, Worker, WorkerConfig};
//! use std::io::Write;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = Worker::open(WorkerConfig::new("/var/lib/strata").snapshotter("naive"))?;
//!
//! // Keep everything this step creates alive until it is done
//! let lease = worker.leases().guard()?;
//! lease.pin(Resource::Snapshot("base".into()))?;
//!
//! let mounts = worker.snapshots().prepare("build-1", None)?;
//! // ... run the step in `mounts` ...
//! worker.snapshots().commit("build-1", "base")?;
//!
//! let mut writer = worker.content().open_writer(None)?;
//! writer.write_all(b"layer tarball")?;
//! let blob = writer.commit(None)?;
//! worker.set_root("base-layer", Resource::Content(blob.digest))?;
//!
//! drop(lease);
//! let stats = worker.gc(false)?;
//! println!("Deleted {} snapshots", stats.snapshots_deleted);
//! # Ok(())
//! # }
//! ```

mod blobfile;
mod cancel;
mod config;
mod content;
mod diff;
mod digest;
mod error;
mod gc;
mod lease;
mod metadata;
mod snapshot;
mod worker;

pub use blobfile::{BlobHeader, CompressionType};
pub use cancel::Cancel;
pub use config::{GcPolicy, StoreConfig, WorkerConfig};
pub use content::{Blob, ContentStore, IngestStatus, Writer};
pub use diff::{LABEL_DIFF, LABEL_DIFF_LOWER};
pub use digest::{Algorithm, Digest, Digester};
pub use error::{Error, Result};
pub use gc::{GcFailure, GcStats, Marked, REF_CONTENT_PREFIX, REF_SNAPSHOT_PREFIX, mark};
pub use lease::{Lease, LeaseGuard, LeaseId, LeaseManager};
pub use metadata::{
    BlobRecord, Db, Kind, LeaseRecord, Resource, SnapshotRecord, Tables, Usage,
};
pub use snapshot::{
    BackendKind, Changes, Mount, MountType, SnapshotInfo, Snapshotter, WHITEOUT_PREFIX,
};
pub use worker::{DiskUsage, Executor, LABEL_EXECUTOR, LABEL_SNAPSHOTTER, Worker};
