//! Snapshot storage backends.
//!
//! Each snapshot owns one layer directory, `<snapshots>/<id>/`, holding its
//! filesystem tree under `fs/`. The overlay backend also keeps an overlayfs
//! `work/` directory next to it while the layer is active.

use super::mount::Mount;
use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::metadata::{Kind, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const FS_DIR: &str = "fs";
const WORK_DIR: &str = "work";

/// Layering strategy, fixed for the lifetime of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Copy-on-write layering through overlayfs.
    #[serde(rename = "overlayfs")]
    Overlay,
    /// Every layer is a full copy of its parent.
    #[serde(rename = "naive")]
    Naive,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Overlay => "overlayfs",
            BackendKind::Naive => "naive",
        }
    }

    /// Parse a backend selector. Unknown names are a `Config` error.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "overlayfs" | "overlay" => Ok(BackendKind::Overlay),
            "naive" => Ok(BackendKind::Naive),
            _ => Err(Error::config(format!(
                "unknown snapshotter backend '{}' (expected overlayfs or naive)",
                s
            ))),
        }
    }

    /// Materialize a new layer at `layer` on top of `parents` (nearest first).
    pub(crate) fn prepare(
        self,
        layer: &Path,
        parents: &[PathBuf],
        kind: Kind,
        cancel: &Cancel,
    ) -> Result<()> {
        cancel.check("prepare")?;
        let layer_fs = fs_dir(layer);

        match self {
            BackendKind::Naive => match parents.first() {
                Some(parent) => copy_tree(&fs_dir(parent), &layer_fs, cancel),
                None => {
                    fs::create_dir_all(&layer_fs)?;
                    Ok(())
                }
            },
            BackendKind::Overlay => {
                fs::create_dir_all(&layer_fs)?;
                if kind == Kind::Active {
                    fs::create_dir_all(layer.join(WORK_DIR))?;
                }
                Ok(())
            }
        }
    }

    /// Mounts exposing `layer` on top of `parents` (nearest first).
    pub(crate) fn mounts(self, layer: &Path, parents: &[PathBuf], kind: Kind) -> Vec<Mount> {
        let readonly = kind == Kind::View;

        match self {
            BackendKind::Naive => vec![Mount::bind(fs_dir(layer), readonly)],
            BackendKind::Overlay => {
                let lower: Vec<PathBuf> = parents.iter().map(|p| fs_dir(p)).collect();
                match (kind, lower.as_slice()) {
                    (_, []) => vec![Mount::bind(fs_dir(layer), readonly)],
                    (Kind::View, [single]) => vec![Mount::bind(single.clone(), true)],
                    (Kind::View, _) => vec![Mount::overlay(&lower, None)],
                    _ => {
                        let upper = fs_dir(layer);
                        let work = layer.join(WORK_DIR);
                        vec![Mount::overlay(&lower, Some((&upper, &work)))]
                    }
                }
            }
        }
    }

    /// Freeze `layer` after its record became committed.
    pub(crate) fn commit(self, layer: &Path) -> Result<()> {
        match self {
            BackendKind::Naive => Ok(()),
            BackendKind::Overlay => remove_if_exists(&layer.join(WORK_DIR)),
        }
    }

    /// Delete `layer` and everything under it.
    pub(crate) fn remove(self, layer: &Path) -> Result<()> {
        remove_if_exists(layer)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::parse(s)
    }
}

pub(crate) fn fs_dir(layer: &Path) -> PathBuf {
    layer.join(FS_DIR)
}

/// Bytes and inodes under `root`, not counting `root` itself.
///
/// A missing `root` has zero usage.
pub(crate) fn usage_of(root: &Path) -> Result<Usage> {
    let mut usage = Usage::default();
    if !root.exists() {
        return Ok(usage);
    }

    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .build();

    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let metadata = entry.path().symlink_metadata()?;
        usage.inodes += 1;
        if metadata.is_file() {
            usage.size += metadata.len();
        }
    }

    Ok(usage)
}

/// Recursively copy `src` to `dst`, checking `cancel` between entries.
///
/// Ownership, permissions and timestamps are kept, hardlinks stay linked,
/// and FIFOs and device nodes are recreated rather than read. Sockets are
/// skipped.
fn copy_tree(src: &Path, dst: &Path, cancel: &Cancel) -> Result<()> {
    let walker = ignore::WalkBuilder::new(src)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .build();

    let mut linked: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut dirs = Vec::new();

    for entry in walker {
        cancel.check("prepare")?;
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).map_err(|_| {
            Error::invalid_state(entry.path().display().to_string(), "outside of parent layer")
        })?;
        let target = dst.join(relative);
        let metadata = entry.path().symlink_metadata()?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((target, metadata));
            continue;
        }

        if let Some(inode) = inode_key(&metadata) {
            if let Some(first) = linked.get(&inode) {
                fs::hard_link(first, &target)?;
                continue;
            }
            linked.insert(inode, target.clone());
        }

        if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if !copy_special(entry.path(), &target, &metadata)? {
            continue;
        }
        copy_attributes(&target, &metadata, !file_type.is_symlink())?;
    }

    // Deepest first, after their contents, so a read-only mode or an mtime
    // is not disturbed by later writes.
    for (target, metadata) in dirs.into_iter().rev() {
        copy_attributes(&target, &metadata, true)?;
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<()> {
    Err(Error::invalid_state(
        src.display().to_string(),
        "symlinks are not supported on this platform",
    ))
}

/// Recreate a FIFO or device node at `dst`. Returns false for sockets,
/// which are not copied.
#[cfg(unix)]
fn copy_special(src: &Path, dst: &Path, metadata: &fs::Metadata) -> Result<bool> {
    use nix::sys::stat::{Mode, SFlag, mknod};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let file_type = metadata.file_type();
    let perm = Mode::from_bits_truncate((metadata.mode() & 0o7777) as _);

    if file_type.is_fifo() {
        nix::unistd::mkfifo(dst, perm).map_err(io::Error::from)?;
    } else if file_type.is_char_device() || file_type.is_block_device() {
        let kind = if file_type.is_char_device() {
            SFlag::S_IFCHR
        } else {
            SFlag::S_IFBLK
        };
        mknod(dst, kind, perm, metadata.rdev() as _).map_err(io::Error::from)?;
    } else {
        debug!(path = %src.display(), "skipping socket");
        return Ok(false);
    }
    Ok(true)
}

#[cfg(not(unix))]
fn copy_special(src: &Path, _dst: &Path, _metadata: &fs::Metadata) -> Result<bool> {
    Err(Error::invalid_state(
        src.display().to_string(),
        "special files are not supported on this platform",
    ))
}

/// Apply the owner, mode and timestamps of `metadata` to `target`.
#[cfg(unix)]
fn copy_attributes(target: &Path, metadata: &fs::Metadata, set_mode: bool) -> Result<()> {
    use nix::sys::stat::lutimes;
    use nix::sys::time::TimeVal;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let current = target.symlink_metadata()?;
    if current.uid() != metadata.uid() || current.gid() != metadata.gid() {
        std::os::unix::fs::lchown(target, Some(metadata.uid()), Some(metadata.gid()))?;
    }
    // After chown, which clears setuid bits
    if set_mode {
        fs::set_permissions(target, fs::Permissions::from_mode(metadata.mode() & 0o7777))?;
    }

    let atime = TimeVal::new(metadata.atime() as _, (metadata.atime_nsec() / 1000) as _);
    let mtime = TimeVal::new(metadata.mtime() as _, (metadata.mtime_nsec() / 1000) as _);
    lutimes(target, &atime, &mtime).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_attributes(target: &Path, metadata: &fs::Metadata, set_mode: bool) -> Result<()> {
    if set_mode {
        fs::set_permissions(target, metadata.permissions())?;
    }
    Ok(())
}

/// (device, inode) of a file with more than one link.
#[cfg(unix)]
fn inode_key(metadata: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (metadata.nlink() > 1).then(|| (metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn inode_key(_metadata: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
