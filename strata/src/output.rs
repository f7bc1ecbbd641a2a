//! Output formatting for CLI commands.
//!
//! Every command produces a serializable DTO. In JSON mode the DTO is printed
//! as-is; in text mode a closure renders a human-readable form.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use strata_core::{
    Blob, Changes, Digest, DiskUsage, GcStats, IngestStatus, Lease, Mount, Resource, SnapshotInfo,
    Usage,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
        }
    }

    /// Write `data` as JSON, or the result of `text_fn` in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        let mut stdout = io::stdout().lock();
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Wraps a command payload with the common status fields.
#[derive(Debug, Serialize)]
pub struct Success<T: Serialize> {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Success<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            result_code: 0,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub root: String,
    pub worker_id: String,
    pub snapshotter: String,
    pub algorithm: String,
}

/// Output for `content ingest` and `content info`.
#[derive(Debug, Serialize)]
pub struct BlobOutput {
    #[serde(flatten)]
    pub blob: Blob,
    /// The bytes were already stored.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub existing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BlobListOutput {
    pub blobs: Vec<Blob>,
}

#[derive(Debug, Serialize)]
pub struct IngestListOutput {
    pub ingests: Vec<IngestStatus>,
}

/// Output for `snapshot prepare`, `snapshot view` and `snapshot mounts`.
#[derive(Debug, Serialize)]
pub struct MountsOutput {
    pub key: String,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotOutput {
    #[serde(flatten)]
    pub snapshot: SnapshotInfo,
}

#[derive(Debug, Serialize)]
pub struct SnapshotListOutput {
    pub snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Serialize)]
pub struct UsageOutput {
    pub key: String,
    #[serde(flatten)]
    pub usage: Usage,
}

/// Output for `snapshot apply`.
#[derive(Debug, Serialize)]
pub struct ChangesOutput {
    pub key: String,
    pub digest: Digest,
    #[serde(flatten)]
    pub changes: Changes,
}

/// Output for commands that delete or release something by name.
#[derive(Debug, Serialize)]
pub struct RemovedOutput {
    pub kind: &'static str,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct LeaseOutput {
    #[serde(flatten)]
    pub lease: Lease,
}

#[derive(Debug, Serialize)]
pub struct LeaseListOutput {
    pub leases: Vec<Lease>,
}

/// Output for `lease pin` and `lease unpin`.
#[derive(Debug, Serialize)]
pub struct PinOutput {
    pub lease: String,
    pub resource: Resource,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RootInfo {
    pub name: String,
    pub resource: Resource,
}

#[derive(Debug, Serialize)]
pub struct RootListOutput {
    pub roots: Vec<RootInfo>,
}

#[derive(Debug, Serialize)]
pub struct GcOutput {
    #[serde(flatten)]
    pub stats: GcStats,
}

#[derive(Debug, Serialize)]
pub struct DuOutput {
    #[serde(flatten)]
    pub usage: DiskUsage,
    pub total: u64,
}

/// Output for `info`.
#[derive(Debug, Serialize)]
pub struct InfoOutput {
    pub worker_id: String,
    pub root: String,
    pub snapshotter: String,
    pub labels: BTreeMap<String, String>,
    pub snapshots: usize,
    pub blobs: usize,
    pub leases: usize,
    pub roots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<u64>,
}

// ============================================================================
// Text rendering helpers
// ============================================================================

pub fn labels_text(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn mounts_text(mounts: &[Mount]) -> String {
    mounts.iter().map(|m| format!("{}\n", m)).collect()
}

pub fn snapshot_text(info: &SnapshotInfo) -> String {
    let mut text = format!("Key: {}\n", info.key);
    text.push_str(&format!("Kind: {}\n", info.kind));
    text.push_str(&format!(
        "Parent: {}\n",
        info.parent.as_deref().unwrap_or("-")
    ));
    text.push_str(&format!("Created: {}\n", info.created_at.to_rfc3339()));
    text.push_str(&format!("Updated: {}\n", info.updated_at.to_rfc3339()));
    if let Some(usage) = info.usage {
        text.push_str(&format!(
            "Usage: {} bytes, {} inodes\n",
            usage.size, usage.inodes
        ));
    }
    if !info.labels.is_empty() {
        text.push_str(&format!("Labels: {}\n", labels_text(&info.labels)));
    }
    text
}

pub fn lease_text(lease: &Lease) -> String {
    let expires = match lease.expires_at {
        Some(_) if lease.is_expired(Utc::now()) => "expired".to_string(),
        Some(at) => format!("expires {}", at.to_rfc3339()),
        None => "no expiry".to_string(),
    };
    let mut text = format!("{} ({})\n", lease.id, expires);
    for pin in &lease.pins {
        text.push_str(&format!("  {}\n", pin));
    }
    text
}

pub fn gc_text(stats: &GcStats) -> String {
    let (prefix, verb) = if stats.dry_run {
        ("Dry run - nothing deleted\n", "Would delete")
    } else {
        ("", "Deleted")
    };
    let mut text = prefix.to_string();
    text.push_str(&format!(
        "{} {} snapshots, {} blobs ({} bytes)\n",
        verb, stats.snapshots_deleted, stats.blobs_deleted, stats.bytes_freed
    ));
    text.push_str(&format!(
        "Expired leases: {}, orphans: {}, stale ingests: {}\n",
        stats.leases_expired, stats.orphans_removed, stats.ingests_removed
    ));
    for failure in &stats.failures {
        text.push_str(&format!("Failed: {}: {}\n", failure.object, failure.error));
    }
    text
}
