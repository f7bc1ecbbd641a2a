//! The worker: one handle over metadata, content, snapshots and leases.
//!
//! Layout under `<root>/strata-<snapshotter>/`:
//!
//! ```text
//! lock            # held exclusively while a Worker is open
//! config          # key=value, validated on open
//! workerid        # stable worker identity
//! metadata.json   # all records
//! content/        # blob store
//! snapshots/      # snapshot layers
//! executor/       # executor state
//! ```

use crate::config::{GcPolicy, StoreConfig, WorkerConfig};
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::gc::GcStats;
use crate::lease::LeaseManager;
use crate::metadata::{Db, Resource, Tables};
use crate::snapshot::{BackendKind, Mount, Snapshotter, usage_of};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Worker label naming the executor.
pub const LABEL_EXECUTOR: &str = "strata.worker.executor";
/// Worker label naming the snapshotter backend.
pub const LABEL_SNAPSHOTTER: &str = "strata.worker.snapshotter";

const LOCK_FILE: &str = "lock";
const CONFIG_FILE: &str = "config";
const WORKER_ID_FILE: &str = "workerid";
const METADATA_FILE: &str = "metadata.json";
const CONTENT_DIR: &str = "content";
const SNAPSHOTS_DIR: &str = "snapshots";
const EXECUTOR_DIR: &str = "executor";

/// Runs build steps inside snapshot mounts.
pub trait Executor: Send + Sync {
    fn run(&self, mounts: &[Mount], args: &[String]) -> Result<()>;
}

/// Bytes used by each part of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub content: u64,
    pub snapshots: u64,
    pub metadata: u64,
}

impl DiskUsage {
    pub fn total(&self) -> u64 {
        self.content + self.snapshots + self.metadata
    }
}

/// A build worker.
pub struct Worker {
    id: String,
    root: PathBuf,
    labels: BTreeMap<String, String>,
    policy: GcPolicy,
    pub(crate) db: Arc<Db>,
    pub(crate) content: ContentStore,
    pub(crate) snapshots: Snapshotter,
    leases: LeaseManager,
    executor: Option<Box<dyn Executor>>,
    /// Exclusive lock on `<root>/lock`, released on drop.
    _lock: File,
}

impl Worker {
    /// Open the worker described by `config`, creating it if needed.
    ///
    /// Fails with `Config` for an unknown snapshotter or a config file that
    /// does not match, and with `InUse` while another handle has the worker
    /// open.
    pub fn open(config: WorkerConfig) -> Result<Self> {
        let backend = BackendKind::parse(&config.snapshotter)?;
        let root = config.root.join(format!("strata-{}", backend));
        fs::create_dir_all(&root)?;
        let lock = lock_worker(&root)?;

        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let existing = StoreConfig::parse(&fs::read_to_string(&config_path)?)?;
            if existing.snapshotter != backend {
                return Err(Error::config(format!(
                    "worker at {} uses snapshotter {}, not {}",
                    root.display(),
                    existing.snapshotter,
                    backend
                )));
            }
        } else {
            fs::write(&config_path, StoreConfig::new(backend).render())?;
        }

        let id = load_or_create_id(&root.join(WORKER_ID_FILE))?;

        let db = Arc::new(Db::open(root.join(METADATA_FILE))?);
        let content = ContentStore::open(root.join(CONTENT_DIR), db.clone())?;
        let snapshots = Snapshotter::open(root.join(SNAPSHOTS_DIR), db.clone(), backend)?;
        let leases = LeaseManager::new(db.clone());
        fs::create_dir_all(root.join(EXECUTOR_DIR))?;

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_EXECUTOR.to_string(), "oci".to_string());
        labels.insert(LABEL_SNAPSHOTTER.to_string(), backend.to_string());
        labels.extend(config.labels);

        info!(worker = %id, root = %root.display(), snapshotter = %backend, "opened worker");

        Ok(Self {
            id,
            root,
            labels,
            policy: config.gc,
            db,
            content,
            snapshots,
            leases,
            executor: None,
            _lock: lock,
        })
    }

    /// Attach the executor used by [`run`](Self::run).
    pub fn with_executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Box::new(executor));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker directory, `<root>/strata-<snapshotter>`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn backend(&self) -> BackendKind {
        self.snapshots.backend()
    }

    pub fn policy(&self) -> &GcPolicy {
        &self.policy
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn snapshots(&self) -> &Snapshotter {
        &self.snapshots
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Path of the metadata document.
    pub fn metadata_path(&self) -> &Path {
        self.db.path()
    }

    /// A point-in-time copy of all metadata records.
    pub fn metadata(&self) -> Result<Tables> {
        self.db.snapshot()
    }

    /// Run `args` in the mounts of the active snapshot `key`.
    pub fn run(&self, key: &str, args: &[String]) -> Result<()> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| Error::config("worker has no executor"))?;
        let mounts = self.snapshots.mounts(key)?;
        debug!(key, args = ?args, "running executor");
        executor.run(&mounts, args)
    }

    /// Pin `resource` under the root label `name`, replacing any previous target.
    pub fn set_root(&self, name: &str, resource: Resource) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_key("Root label cannot be empty"));
        }
        self.db.update(|tables| {
            tables.roots.insert(name.to_string(), resource.clone());
            Ok(())
        })?;
        debug!(name, resource = %resource, "set root label");
        Ok(())
    }

    /// Drop the root label `name`.
    pub fn remove_root(&self, name: &str) -> Result<Resource> {
        let resource = self.db.update(|tables| {
            tables
                .roots
                .remove(name)
                .ok_or_else(|| Error::not_found("root label", name))
        })?;
        debug!(name, resource = %resource, "removed root label");
        Ok(resource)
    }

    pub fn roots(&self) -> Result<BTreeMap<String, Resource>> {
        self.db.view(|tables| Ok(tables.roots.clone()))
    }

    /// Bytes used on disk by content, snapshots and metadata.
    pub fn disk_usage(&self) -> Result<DiskUsage> {
        let metadata = match fs::metadata(self.db.path()) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(DiskUsage {
            content: usage_of(self.content.root())?.size,
            snapshots: usage_of(self.snapshots.root())?.size,
            metadata,
        })
    }

    /// Collect if disk usage is above the policy's high-water mark.
    pub fn maybe_gc(&self) -> Result<Option<GcStats>> {
        let Some(limit) = self.policy.high_water_mark else {
            return Ok(None);
        };
        let used = self.disk_usage()?.total();
        if used <= limit {
            debug!(used, limit, "below high-water mark");
            return Ok(None);
        }
        info!(used, limit, "high-water mark exceeded, collecting");
        self.gc(false).map(Some)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("labels", &self.labels)
            .field("backend", &self.backend())
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

fn lock_worker(root: &Path) -> Result<File> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Err(
            Error::in_use(root.display().to_string(), "worker is open in another handle"),
        ),
        Err(e) => Err(e.into()),
    }
}

fn load_or_create_id(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
        Ok(_) => Err(Error::config(format!("empty worker id in {}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            fs::write(path, format!("{}\n", id))?;
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}
