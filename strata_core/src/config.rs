//! Worker configuration.
//!
//! [`WorkerConfig`] is what a caller passes to [`Worker::open`](crate::Worker::open).
//! [`StoreConfig`] is the `key=value` file written into the worker directory
//! at creation and validated on every open:
//!
//! ```text
//! version=1
//! algo=blake3-256
//! snapshotter=overlayfs
//! ```

use crate::digest::Algorithm;
use crate::error::{Error, Result};
use crate::snapshot::BackendKind;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Current version of the worker config file.
pub const CONFIG_VERSION: u32 = 1;

/// Snapshotter used when none is configured.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// When and how GC reclaims space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcPolicy {
    /// `maybe_gc` collects once the worker uses more bytes than this.
    pub high_water_mark: Option<u64>,
    /// Abandoned ingestions older than this are removed by GC.
    pub ingest_expiry: Duration,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            ingest_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Parameters for opening a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent directory; the worker lives in `<root>/strata-<snapshotter>/`.
    pub root: PathBuf,
    /// Snapshotter backend selector (`overlayfs` or `naive`).
    pub snapshotter: String,
    /// Labels overriding the worker's defaults.
    pub labels: BTreeMap<String, String>,
    pub gc: GcPolicy,
}

impl WorkerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            labels: BTreeMap::new(),
            gc: GcPolicy::default(),
        }
    }

    pub fn snapshotter(mut self, selector: impl Into<String>) -> Self {
        self.snapshotter = selector.into();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn gc_policy(mut self, policy: GcPolicy) -> Self {
        self.gc = policy;
        self
    }
}

/// Contents of the worker's `config` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub version: u32,
    pub algorithm: Algorithm,
    pub snapshotter: BackendKind,
}

impl StoreConfig {
    pub fn new(snapshotter: BackendKind) -> Self {
        Self {
            version: CONFIG_VERSION,
            algorithm: Algorithm::Blake3,
            snapshotter,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "version={}\nalgo={}\nsnapshotter={}\n",
            self.version,
            self.algorithm.as_str(),
            self.snapshotter.as_str()
        )
    }

    /// Parse a config file. Blank lines and `#` comments are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut algo = None;
        let mut snapshotter = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    "snapshotter" => snapshotter = Some(value.trim()),
                    _ => {}
                }
            }
        }

        let version = version
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v == CONFIG_VERSION)
            .ok_or_else(|| {
                Error::config(format!("Unsupported config version: {:?}", version))
            })?;

        let algo = algo.ok_or_else(|| Error::config("Missing algo in config"))?;
        let snapshotter =
            snapshotter.ok_or_else(|| Error::config("Missing snapshotter in config"))?;

        Ok(Self {
            version,
            algorithm: Algorithm::parse(algo)?,
            snapshotter: BackendKind::parse(snapshotter)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_parse() {
        let config = StoreConfig::new(BackendKind::Naive);
        let rendered = config.render();
        assert!(rendered.contains("version=1"));
        assert!(rendered.contains("algo=blake3-256"));
        assert!(rendered.contains("snapshotter=naive"));
        assert_eq!(StoreConfig::parse(&rendered).unwrap(), config);
    }

    #[test]
    fn test_parse_with_comments() {
        let content = "# worker\nversion=1\n\nalgo=blake3-256\nsnapshotter=overlayfs\n# end\n";
        let config = StoreConfig::parse(content).unwrap();
        assert_eq!(config.snapshotter, BackendKind::Overlay);
    }

    #[test]
    fn test_parse_rejects_bad_config() {
        assert!(matches!(
            StoreConfig::parse("version=2\nalgo=blake3-256\nsnapshotter=naive\n"),
            Err(Error::Config { .. })
        ));
        assert!(StoreConfig::parse("version=1\nsnapshotter=naive\n").is_err());
        assert!(StoreConfig::parse("version=1\nalgo=blake3-256\n").is_err());
        assert!(StoreConfig::parse("version=1\nalgo=blake3-256\nsnapshotter=zfs\n").is_err());
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new("/var/lib/strata")
            .snapshotter("naive")
            .label("region", "eu");
        assert_eq!(config.snapshotter, "naive");
        assert_eq!(config.labels["region"], "eu");
        assert_eq!(config.gc, GcPolicy::default());
    }
}
