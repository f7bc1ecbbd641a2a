mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::{
    Algorithm, BackendKind, Blob, Digest, Error, GcStats, LeaseId, Resource, Worker, WorkerConfig,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Strata - snapshot and content storage for build workers
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Snapshot and content store with lease-aware garbage collection", long_about = None)]
#[command(version)]
struct Cli {
    /// Parent directory of the worker (defaults to STRATA_ROOT env var or ./strata-root)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Snapshotter backend: overlayfs or naive
    #[arg(short, long, global = true, default_value = "overlayfs")]
    snapshotter: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the worker directory
    Init,

    /// Manage blobs
    #[command(subcommand)]
    Content(ContentCommands),

    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Manage leases
    #[command(subcommand)]
    Lease(LeaseCommands),

    /// Manage root labels (permanent GC roots)
    #[command(subcommand)]
    Root(RootCommands),

    /// Garbage collect unreferenced snapshots and blobs
    Gc {
        /// Dry run - show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Only collect if disk usage is above this many bytes
        #[arg(long)]
        high_water_mark: Option<u64>,
    },

    /// Show disk usage
    Du,

    /// Show worker information
    Info,
}

#[derive(Subcommand)]
enum ContentCommands {
    /// Store a file (or stdin with "-") as a blob
    Ingest {
        /// File to read
        path: PathBuf,

        /// Digest the bytes must have
        #[arg(long)]
        expected: Option<String>,

        /// Resume or name the ingestion
        #[arg(long)]
        ingest_ref: Option<String>,

        /// Pin the blob under this root label
        #[arg(long)]
        root_label: Option<String>,
    },

    /// Write blob content to stdout
    Cat {
        /// Digest of the blob
        digest: String,
    },

    /// List committed blobs
    Ls,

    /// Show blob metadata
    Info {
        /// Digest of the blob
        digest: String,
    },

    /// Set labels (key=value; an empty value removes the label)
    Label {
        /// Digest of the blob
        digest: String,

        #[arg(required = true, value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// List in-progress ingestions
    Ingests,
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Create a writable snapshot
    Prepare {
        key: String,

        /// Committed parent snapshot
        #[arg(long)]
        parent: Option<String>,
    },

    /// Create a read-only snapshot
    View {
        key: String,

        /// Committed parent snapshot
        #[arg(long)]
        parent: Option<String>,
    },

    /// Commit an active snapshot under a new key
    Commit {
        /// Active snapshot to commit
        active: String,

        /// Key of the committed snapshot
        key: String,
    },

    /// Remove a snapshot
    Rm { key: String },

    /// List snapshots
    Ls,

    /// Show snapshot metadata
    Stat { key: String },

    /// Show the mounts of an active snapshot or view
    Mounts { key: String },

    /// Show disk usage of a snapshot's own layer
    Usage { key: String },

    /// Set labels (key=value; an empty value removes the label)
    Label {
        key: String,

        #[arg(required = true, value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// Store the changes of a snapshot as a tar blob
    Diff {
        /// Upper snapshot
        key: String,

        /// Lower snapshot (defaults to an empty tree)
        #[arg(long)]
        lower: Option<String>,
    },

    /// Unpack a changeset blob into an active snapshot
    Apply {
        /// Blob digest (algo:hex)
        digest: String,

        /// Active snapshot
        key: String,
    },
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// Create a lease
    Create {
        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Lease labels (key=value)
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// Pin a resource (content/<digest> or snapshot/<key>)
    Pin { lease: String, resource: String },

    /// Unpin a resource
    Unpin { lease: String, resource: String },

    /// Release a lease
    Release { lease: String },

    /// List leases
    Ls,
}

#[derive(Subcommand)]
enum RootCommands {
    /// Pin a resource (content/<digest> or snapshot/<key>) under a name
    Add { name: String, resource: String },

    /// Remove a root label
    Rm { name: String },

    /// List root labels
    Ls,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = OutputWriter::new(cli.json);
    if let Err(e) = run(cli, &output) {
        let code = result_code(&e);
        output.write_error(&e, code);
        std::process::exit(i32::from(code));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .init();
}

/// Exit code for an error, by core error kind.
fn result_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::NotFound { .. }) => 2,
        Some(Error::AlreadyExists { .. }) => 3,
        Some(Error::InUse { .. }) => 4,
        Some(Error::InvalidState { .. }) => 5,
        Some(Error::DigestMismatch { .. }) => 6,
        Some(Error::Config { .. }) => 7,
        _ => 1,
    }
}

fn run(cli: Cli, output: &OutputWriter) -> Result<()> {
    // Worker root: CLI arg > STRATA_ROOT env var > ./strata-root default
    let root = cli
        .root
        .or_else(|| std::env::var("STRATA_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./strata-root"));
    let config = WorkerConfig::new(&root).snapshotter(cli.snapshotter);

    if let Commands::Init = cli.command {
        return cmd_init(config, output);
    }

    let worker = open_worker(config)?;
    match cli.command {
        Commands::Init => Ok(()),
        Commands::Content(cmd) => match cmd {
            ContentCommands::Ingest {
                path,
                expected,
                ingest_ref,
                root_label,
            } => cmd_content_ingest(&worker, &path, expected, ingest_ref, root_label, output),
            ContentCommands::Cat { digest } => cmd_content_cat(&worker, &digest),
            ContentCommands::Ls => cmd_content_ls(&worker, output),
            ContentCommands::Info { digest } => cmd_content_info(&worker, &digest, output),
            ContentCommands::Label { digest, labels } => {
                cmd_content_label(&worker, &digest, labels, output)
            }
            ContentCommands::Ingests => cmd_content_ingests(&worker, output),
        },
        Commands::Snapshot(cmd) => match cmd {
            SnapshotCommands::Prepare { key, parent } => {
                cmd_snapshot_create(&worker, &key, parent.as_deref(), false, output)
            }
            SnapshotCommands::View { key, parent } => {
                cmd_snapshot_create(&worker, &key, parent.as_deref(), true, output)
            }
            SnapshotCommands::Commit { active, key } => {
                cmd_snapshot_commit(&worker, &active, &key, output)
            }
            SnapshotCommands::Rm { key } => cmd_snapshot_rm(&worker, &key, output),
            SnapshotCommands::Ls => cmd_snapshot_ls(&worker, output),
            SnapshotCommands::Stat { key } => cmd_snapshot_stat(&worker, &key, output),
            SnapshotCommands::Mounts { key } => cmd_snapshot_mounts(&worker, &key, output),
            SnapshotCommands::Usage { key } => cmd_snapshot_usage(&worker, &key, output),
            SnapshotCommands::Label { key, labels } => {
                cmd_snapshot_label(&worker, &key, labels, output)
            }
            SnapshotCommands::Diff { key, lower } => {
                cmd_snapshot_diff(&worker, lower.as_deref(), &key, output)
            }
            SnapshotCommands::Apply { digest, key } => {
                cmd_snapshot_apply(&worker, &digest, &key, output)
            }
        },
        Commands::Lease(cmd) => match cmd {
            LeaseCommands::Create { ttl, labels } => cmd_lease_create(&worker, ttl, labels, output),
            LeaseCommands::Pin { lease, resource } => {
                cmd_lease_pin(&worker, &lease, &resource, true, output)
            }
            LeaseCommands::Unpin { lease, resource } => {
                cmd_lease_pin(&worker, &lease, &resource, false, output)
            }
            LeaseCommands::Release { lease } => cmd_lease_release(&worker, &lease, output),
            LeaseCommands::Ls => cmd_lease_ls(&worker, output),
        },
        Commands::Root(cmd) => match cmd {
            RootCommands::Add { name, resource } => cmd_root_add(&worker, &name, &resource, output),
            RootCommands::Rm { name } => cmd_root_rm(&worker, &name, output),
            RootCommands::Ls => cmd_root_ls(&worker, output),
        },
        Commands::Gc {
            dry_run,
            high_water_mark,
        } => cmd_gc(&worker, dry_run, high_water_mark, output),
        Commands::Du => cmd_du(&worker, output),
        Commands::Info => cmd_info(&worker, output),
    }
}

/// Open an existing worker; only `init` creates one.
fn open_worker(config: WorkerConfig) -> Result<Worker> {
    let backend = BackendKind::parse(&config.snapshotter)?;
    let dir = config.root.join(format!("strata-{}", backend));
    if !dir.join("config").exists() {
        anyhow::bail!(
            "No worker at {} (run 'strata init' first)",
            dir.display()
        );
    }
    debug!(root = %dir.display(), "opening worker");
    Worker::open(config).with_context(|| format!("Failed to open worker at {}", dir.display()))
}

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid label '{}': expected key=value", s))
}

fn parse_digest(s: &str) -> Result<Digest> {
    Digest::parse(s).with_context(|| format!("Invalid digest: {}", s))
}

/// Parse `content/<digest>` or `snapshot/<key>`.
fn parse_resource(s: &str) -> Result<Resource> {
    match s.split_once('/') {
        Some(("content", digest)) => Ok(Resource::Content(parse_digest(digest)?)),
        Some(("snapshot", key)) if !key.is_empty() => Ok(Resource::Snapshot(key.to_string())),
        _ => anyhow::bail!(
            "Invalid resource '{}': expected content/<digest> or snapshot/<key>",
            s
        ),
    }
}

/// Apply `key=value` edits to `labels`; an empty value removes the key.
fn merge_labels(mut labels: BTreeMap<String, String>, edits: Vec<(String, String)>) -> BTreeMap<String, String> {
    for (key, value) in edits {
        if value.is_empty() {
            labels.remove(&key);
        } else {
            labels.insert(key, value);
        }
    }
    labels
}

fn cmd_init(config: WorkerConfig, output: &OutputWriter) -> Result<()> {
    let root = config.root.clone();
    let worker = Worker::open(config)
        .with_context(|| format!("Failed to initialize worker under {}", root.display()))?;

    let data = InitOutput {
        root: worker.root().display().to_string(),
        worker_id: worker.id().to_string(),
        snapshotter: worker.backend().to_string(),
        algorithm: Algorithm::Blake3.as_str().to_string(),
    };
    output.write(&Success::new(&data), || {
        format!(
            "Initialized strata worker at {}\nWorker ID: {}\nSnapshotter: {}\nAlgorithm: {}\n",
            data.root, data.worker_id, data.snapshotter, data.algorithm
        )
    })
}

fn cmd_content_ingest(
    worker: &Worker,
    path: &Path,
    expected: Option<String>,
    ingest_ref: Option<String>,
    root_label: Option<String>,
    output: &OutputWriter,
) -> Result<()> {
    let expected = expected.as_deref().map(parse_digest).transpose()?;
    let content = worker.content();

    let opened = match &ingest_ref {
        Some(name) => content.resume_writer(name, expected),
        None => content.open_writer(expected),
    };

    let (blob, existing): (Blob, bool) = match (opened, expected) {
        (Err(Error::AlreadyExists { .. }), Some(digest)) => (content.info(&digest)?, true),
        (opened, _) => {
            let mut writer = opened.context("Failed to open content writer")?;
            let mut reader: Box<dyn Read> = if path == Path::new("-") {
                let stdin = io::stdin();
                if stdin.is_terminal() {
                    anyhow::bail!("Refusing to read blob content from a terminal; pipe data to stdin");
                }
                Box::new(stdin.lock())
            } else {
                Box::new(
                    File::open(path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                )
            };
            io::copy(&mut reader, &mut writer)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let blob = writer
                .commit(None)
                .with_context(|| format!("Failed to commit {}", path.display()))?;
            (blob, false)
        }
    };

    if let Some(name) = &root_label {
        worker
            .set_root(name, Resource::Content(blob.digest))
            .with_context(|| format!("Failed to set root label: {}", name))?;
    }

    let text = format!("{} {}\n", blob.digest, path.display());
    let data = BlobOutput {
        blob,
        existing,
        compression: None,
        stored_size: None,
        path: None,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_content_cat(worker: &Worker, digest: &str) -> Result<()> {
    let digest = parse_digest(digest)?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    worker
        .content()
        .copy_to(&digest, &mut handle)
        .with_context(|| format!("Failed to output blob {}", digest))?;
    Ok(())
}

fn cmd_content_ls(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let blobs = worker.content().list().context("Failed to list blobs")?;
    let text = if blobs.is_empty() {
        "No blobs\n".to_string()
    } else {
        blobs
            .iter()
            .map(|b| format!("{} {:>10} {}\n", b.digest, b.size, b.created_at.to_rfc3339()))
            .collect()
    };
    output.write(&Success::new(BlobListOutput { blobs }), || text)
}

fn cmd_content_info(worker: &Worker, digest: &str, output: &OutputWriter) -> Result<()> {
    let digest = parse_digest(digest)?;
    let content = worker.content();
    let blob = content
        .info(&digest)
        .with_context(|| format!("Failed to stat blob {}", digest))?;
    let header = content
        .header(&digest)
        .with_context(|| format!("Failed to read blob header {}", digest))?;
    let path = content.blob_path(&digest);

    let mut text = format!("Digest: {}\n", blob.digest);
    text.push_str(&format!("Size: {} bytes\n", blob.size));
    text.push_str(&format!(
        "Stored: {} bytes ({})\n",
        header.payload_len,
        header.compression.as_str()
    ));
    text.push_str(&format!("Created: {}\n", blob.created_at.to_rfc3339()));
    if !blob.labels.is_empty() {
        text.push_str(&format!("Labels: {}\n", labels_text(&blob.labels)));
    }
    text.push_str(&format!("Path: {}\n", path.display()));

    let data = BlobOutput {
        blob,
        existing: false,
        compression: Some(header.compression.as_str().to_string()),
        stored_size: Some(header.payload_len),
        path: Some(path.display().to_string()),
    };
    output.write(&Success::new(data), || text)
}

fn cmd_content_label(
    worker: &Worker,
    digest: &str,
    edits: Vec<(String, String)>,
    output: &OutputWriter,
) -> Result<()> {
    let digest = parse_digest(digest)?;
    let content = worker.content();
    let current = content
        .info(&digest)
        .with_context(|| format!("Failed to stat blob {}", digest))?;
    let blob = content
        .update_labels(&digest, merge_labels(current.labels, edits))
        .with_context(|| format!("Failed to update labels of {}", digest))?;

    let text = format!("{} {}\n", blob.digest, labels_text(&blob.labels));
    let data = BlobOutput {
        blob,
        existing: false,
        compression: None,
        stored_size: None,
        path: None,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_content_ingests(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let ingests = worker
        .content()
        .ingests()
        .context("Failed to list ingestions")?;
    let text = if ingests.is_empty() {
        "No ingestions\n".to_string()
    } else {
        ingests
            .iter()
            .map(|i| format!("{} {} bytes\n", i.ingest_ref, i.offset))
            .collect()
    };
    output.write(&Success::new(IngestListOutput { ingests }), || text)
}

fn cmd_snapshot_create(
    worker: &Worker,
    key: &str,
    parent: Option<&str>,
    view: bool,
    output: &OutputWriter,
) -> Result<()> {
    let snapshots = worker.snapshots();
    let mounts = if view {
        snapshots.view(key, parent)
    } else {
        snapshots.prepare(key, parent)
    }
    .with_context(|| format!("Failed to create snapshot {}", key))?;

    let text = mounts_text(&mounts);
    let data = MountsOutput {
        key: key.to_string(),
        mounts,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_snapshot_commit(
    worker: &Worker,
    active: &str,
    key: &str,
    output: &OutputWriter,
) -> Result<()> {
    let snapshot = worker
        .snapshots()
        .commit(active, key)
        .with_context(|| format!("Failed to commit {} as {}", active, key))?;

    let text = format!("Committed {} as {}\n", active, key);
    output.write(&Success::new(SnapshotOutput { snapshot }), || text)
}

fn cmd_snapshot_rm(worker: &Worker, key: &str, output: &OutputWriter) -> Result<()> {
    worker
        .snapshots()
        .remove(key)
        .with_context(|| format!("Failed to remove snapshot {}", key))?;

    let data = RemovedOutput {
        kind: "snapshot",
        key: key.to_string(),
    };
    output.write(&Success::new(data), || format!("Removed snapshot: {}\n", key))
}

fn cmd_snapshot_ls(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let snapshots = worker
        .snapshots()
        .list()
        .context("Failed to list snapshots")?;
    let text = if snapshots.is_empty() {
        "No snapshots\n".to_string()
    } else {
        snapshots
            .iter()
            .map(|s| {
                format!(
                    "{:<10} {} {}\n",
                    s.kind.as_str(),
                    s.key,
                    s.parent.as_deref().unwrap_or("-")
                )
            })
            .collect()
    };
    output.write(&Success::new(SnapshotListOutput { snapshots }), || text)
}

fn cmd_snapshot_stat(worker: &Worker, key: &str, output: &OutputWriter) -> Result<()> {
    let snapshot = worker
        .snapshots()
        .stat(key)
        .with_context(|| format!("Failed to stat snapshot {}", key))?;
    let text = snapshot_text(&snapshot);
    output.write(&Success::new(SnapshotOutput { snapshot }), || text)
}

fn cmd_snapshot_mounts(worker: &Worker, key: &str, output: &OutputWriter) -> Result<()> {
    let mounts = worker
        .snapshots()
        .mounts(key)
        .with_context(|| format!("Failed to get mounts of {}", key))?;
    let text = mounts_text(&mounts);
    let data = MountsOutput {
        key: key.to_string(),
        mounts,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_snapshot_usage(worker: &Worker, key: &str, output: &OutputWriter) -> Result<()> {
    let usage = worker
        .snapshots()
        .usage(key)
        .with_context(|| format!("Failed to measure snapshot {}", key))?;
    let text = format!("{} {} bytes, {} inodes\n", key, usage.size, usage.inodes);
    let data = UsageOutput {
        key: key.to_string(),
        usage,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_snapshot_diff(worker: &Worker, lower: Option<&str>, key: &str, output: &OutputWriter) -> Result<()> {
    let blob = worker
        .diff(lower, key)
        .with_context(|| format!("Failed to diff snapshot {}", key))?;
    let text = format!("{} {} bytes\n", blob.digest, blob.size);
    let data = BlobOutput {
        blob,
        existing: false,
        compression: None,
        stored_size: None,
        path: None,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_snapshot_apply(worker: &Worker, digest: &str, key: &str, output: &OutputWriter) -> Result<()> {
    let digest = parse_digest(digest)?;
    let changes = worker
        .apply(&digest, key)
        .with_context(|| format!("Failed to apply {} to snapshot {}", digest, key))?;
    let text = format!(
        "{} {} added, {} modified, {} removed\n",
        key, changes.added, changes.modified, changes.removed
    );
    let data = ChangesOutput {
        key: key.to_string(),
        digest,
        changes,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_snapshot_label(
    worker: &Worker,
    key: &str,
    edits: Vec<(String, String)>,
    output: &OutputWriter,
) -> Result<()> {
    let snapshots = worker.snapshots();
    let current = snapshots
        .stat(key)
        .with_context(|| format!("Failed to stat snapshot {}", key))?;
    let snapshot = snapshots
        .update_labels(key, merge_labels(current.labels, edits))
        .with_context(|| format!("Failed to update labels of {}", key))?;

    let text = format!("{} {}\n", snapshot.key, labels_text(&snapshot.labels));
    output.write(&Success::new(SnapshotOutput { snapshot }), || text)
}

fn cmd_lease_create(
    worker: &Worker,
    ttl: Option<u64>,
    labels: Vec<(String, String)>,
    output: &OutputWriter,
) -> Result<()> {
    let leases = worker.leases();
    let id = leases
        .create_with(ttl.map(Duration::from_secs), labels.into_iter().collect())
        .context("Failed to create lease")?;
    let lease = leases.get(&id)?;

    let text = format!("{}\n", lease.id);
    output.write(&Success::new(LeaseOutput { lease }), || text)
}

fn cmd_lease_pin(
    worker: &Worker,
    lease: &str,
    resource: &str,
    pin: bool,
    output: &OutputWriter,
) -> Result<()> {
    let id = LeaseId::from(lease);
    let resource = parse_resource(resource)?;
    let leases = worker.leases();

    let pinned = if pin {
        leases
            .add_pin(&id, resource.clone())
            .with_context(|| format!("Failed to pin {} to lease {}", resource, lease))?;
        true
    } else {
        let removed = leases
            .remove_pin(&id, &resource)
            .with_context(|| format!("Failed to unpin {} from lease {}", resource, lease))?;
        !removed
    };

    let text = if pin {
        format!("Pinned {} to {}\n", resource, lease)
    } else {
        format!("Unpinned {} from {}\n", resource, lease)
    };
    let data = PinOutput {
        lease: lease.to_string(),
        resource,
        pinned,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_lease_release(worker: &Worker, lease: &str, output: &OutputWriter) -> Result<()> {
    worker
        .leases()
        .release(&LeaseId::from(lease))
        .with_context(|| format!("Failed to release lease {}", lease))?;

    let data = RemovedOutput {
        kind: "lease",
        key: lease.to_string(),
    };
    output.write(&Success::new(data), || format!("Released lease: {}\n", lease))
}

fn cmd_lease_ls(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let leases = worker.leases().list().context("Failed to list leases")?;
    let text = if leases.is_empty() {
        "No leases\n".to_string()
    } else {
        leases.iter().map(lease_text).collect()
    };
    output.write(&Success::new(LeaseListOutput { leases }), || text)
}

fn cmd_root_add(worker: &Worker, name: &str, resource: &str, output: &OutputWriter) -> Result<()> {
    let resource = parse_resource(resource)?;
    worker
        .set_root(name, resource.clone())
        .with_context(|| format!("Failed to add root label: {}", name))?;

    let text = format!("{} -> {}\n", name, resource);
    let data = RootInfo {
        name: name.to_string(),
        resource,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_root_rm(worker: &Worker, name: &str, output: &OutputWriter) -> Result<()> {
    worker
        .remove_root(name)
        .with_context(|| format!("Failed to remove root label: {}", name))?;

    let data = RemovedOutput {
        kind: "root label",
        key: name.to_string(),
    };
    output.write(&Success::new(data), || format!("Removed root label: {}\n", name))
}

fn cmd_root_ls(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let roots: Vec<RootInfo> = worker
        .roots()
        .context("Failed to list root labels")?
        .into_iter()
        .map(|(name, resource)| RootInfo { name, resource })
        .collect();

    let text = if roots.is_empty() {
        "No root labels\n".to_string()
    } else {
        roots
            .iter()
            .map(|r| format!("{} -> {}\n", r.name, r.resource))
            .collect()
    };
    output.write(&Success::new(RootListOutput { roots }), || text)
}

fn cmd_gc(
    worker: &Worker,
    dry_run: bool,
    high_water_mark: Option<u64>,
    output: &OutputWriter,
) -> Result<()> {
    if let Some(limit) = high_water_mark {
        let used = worker.disk_usage().context("Failed to measure disk usage")?.total();
        if used <= limit {
            let stats = GcStats {
                dry_run,
                ..Default::default()
            };
            let text = format!("Usage {} bytes is below {} bytes, nothing to do\n", used, limit);
            return output.write(&Success::new(GcOutput { stats }), || text);
        }
    }

    let stats = worker
        .gc(dry_run)
        .context("Failed to run garbage collection")?;
    let text = gc_text(&stats);
    output.write(&Success::new(GcOutput { stats }), || text)
}

fn cmd_du(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let usage = worker.disk_usage().context("Failed to measure disk usage")?;
    let text = format!(
        "Content:   {} bytes\nSnapshots: {} bytes\nMetadata:  {} bytes\nTotal:     {} bytes\n",
        usage.content,
        usage.snapshots,
        usage.metadata,
        usage.total()
    );
    let data = DuOutput {
        total: usage.total(),
        usage,
    };
    output.write(&Success::new(data), || text)
}

fn cmd_info(worker: &Worker, output: &OutputWriter) -> Result<()> {
    let tables = worker.metadata().context("Failed to read metadata")?;
    let data = InfoOutput {
        worker_id: worker.id().to_string(),
        root: worker.root().display().to_string(),
        snapshotter: worker.backend().to_string(),
        labels: worker.labels().clone(),
        snapshots: tables.snapshots.len(),
        blobs: tables.blobs.len(),
        leases: tables.leases.len(),
        roots: tables.roots.len(),
        high_water_mark: worker.policy().high_water_mark,
    };

    let mut text = format!("Worker ID: {}\n", data.worker_id);
    text.push_str(&format!("Root: {}\n", data.root));
    text.push_str(&format!("Snapshotter: {}\n", data.snapshotter));
    text.push_str(&format!("Labels: {}\n", labels_text(&data.labels)));
    text.push_str(&format!(
        "Snapshots: {}, blobs: {}, leases: {}, root labels: {}\n",
        data.snapshots, data.blobs, data.leases, data.roots
    ));
    output.write(&Success::new(&data), || text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource() {
        let digest = Digest::of_bytes(b"x");
        assert_eq!(
            parse_resource(&format!("content/{}", digest)).unwrap(),
            Resource::Content(digest)
        );
        assert_eq!(
            parse_resource("snapshot/build/step-1").unwrap(),
            Resource::Snapshot("build/step-1".to_string())
        );
        assert!(parse_resource("snapshot/").is_err());
        assert!(parse_resource("blob/abc").is_err());
        assert!(parse_resource("content/zz").is_err());
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(
            parse_label("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_label("novalue").is_err());
    }

    #[test]
    fn test_merge_labels() {
        let current: BTreeMap<String, String> = [
            ("keep".to_string(), "1".to_string()),
            ("drop".to_string(), "2".to_string()),
        ]
        .into_iter()
        .collect();
        let merged = merge_labels(
            current,
            vec![
                ("drop".to_string(), String::new()),
                ("new".to_string(), "3".to_string()),
            ],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["keep"], "1");
        assert_eq!(merged["new"], "3");
    }

    #[test]
    fn test_result_codes() {
        let err = anyhow::Error::new(Error::not_found("snapshot", "S1")).context("Failed");
        assert_eq!(result_code(&err), 2);
        let err = anyhow::Error::new(Error::in_use("S1", "pinned"));
        assert_eq!(result_code(&err), 4);
        assert_eq!(result_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "strata",
            "--json",
            "-s",
            "naive",
            "snapshot",
            "prepare",
            "L1",
            "--parent",
            "S1",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.snapshotter, "naive");
        assert!(matches!(
            cli.command,
            Commands::Snapshot(SnapshotCommands::Prepare { .. })
        ));
    }

    #[test]
    fn test_parse_snapshot_diff() {
        let cli = Cli::try_parse_from(["strata", "snapshot", "diff", "S2", "--lower", "S1"]).unwrap();
        match cli.command {
            Commands::Snapshot(SnapshotCommands::Diff { key, lower }) => {
                assert_eq!(key, "S2");
                assert_eq!(lower.as_deref(), Some("S1"));
            }
            _ => panic!("expected snapshot diff"),
        }
    }
}
