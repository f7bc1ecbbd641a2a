//! Mount descriptions handed to the executor.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Filesystem type of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Bind,
    Overlay,
}

impl MountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountType::Bind => "bind",
            MountType::Overlay => "overlay",
        }
    }
}

/// A single mount, in the form `mount -t <type> -o <options> <source> <target>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub mount_type: MountType,
    pub source: PathBuf,
    pub options: Vec<String>,
}

impl Mount {
    /// A recursive bind mount of `source`.
    pub fn bind(source: impl Into<PathBuf>, readonly: bool) -> Self {
        let access = if readonly { "ro" } else { "rw" };
        Self {
            mount_type: MountType::Bind,
            source: source.into(),
            options: vec!["rbind".to_string(), access.to_string()],
        }
    }

    /// An overlay mount of `lower` (nearest layer first).
    ///
    /// Without `upper` the overlay is read-only.
    pub fn overlay(lower: &[PathBuf], upper: Option<(&Path, &Path)>) -> Self {
        let lowerdir = lower
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        let mut options = Vec::new();
        if let Some((upperdir, workdir)) = upper {
            options.push(format!("workdir={}", workdir.display()));
            options.push(format!("upperdir={}", upperdir.display()));
        }
        options.push(format!("lowerdir={}", lowerdir));

        Self {
            mount_type: MountType::Overlay,
            source: PathBuf::from("overlay"),
            options,
        }
    }

    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find_map(|opt| opt.strip_prefix(name)?.strip_prefix('='))
    }

    pub fn is_readonly(&self) -> bool {
        match self.mount_type {
            MountType::Bind => self.options.iter().any(|o| o == "ro"),
            MountType::Overlay => self.option("upperdir").is_none(),
        }
    }

    /// Directory receiving writes made through this mount.
    pub fn writable_dir(&self) -> Option<PathBuf> {
        if self.is_readonly() {
            return None;
        }
        match self.mount_type {
            MountType::Bind => Some(self.source.clone()),
            MountType::Overlay => self.option("upperdir").map(PathBuf::from),
        }
    }

    /// Directories visible through this mount, topmost first.
    pub fn layers(&self) -> Vec<PathBuf> {
        match self.mount_type {
            MountType::Bind => vec![self.source.clone()],
            MountType::Overlay => {
                let mut layers: Vec<PathBuf> = self.writable_dir().into_iter().collect();
                if let Some(lowerdir) = self.option("lowerdir") {
                    layers.extend(lowerdir.split(':').map(PathBuf::from));
                }
                layers
            }
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.mount_type.as_str(),
            self.source.display(),
            self.options.join(",")
        )
    }
}
