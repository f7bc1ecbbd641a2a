//! Layer changesets.
//!
//! A changeset is a tar stream of what differs between two filesystem
//! trees. Added and modified entries are stored as they appear in the upper
//! tree; a removed entry becomes an empty `.wh.<name>` marker in its parent
//! directory. A removed directory needs only its own marker.

use crate::cancel::Cancel;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

/// File name prefix of a removal marker.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Entry counts of a diff or an apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Changes {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    source: PathBuf,
    dir: bool,
}

/// A merged filesystem view, keyed by path relative to its root.
pub(crate) type Tree = BTreeMap<PathBuf, Node>;

/// Merge layer directories, bottom first, into one view.
///
/// An overlayfs whiteout in a higher layer hides the path below it, and a
/// non-directory hides a lower directory with everything under it.
pub(crate) fn merge_layers(layers: &[PathBuf], cancel: &Cancel) -> Result<Tree> {
    let mut tree = Tree::new();

    for layer in layers {
        if !layer.exists() {
            continue;
        }
        let walker = ignore::WalkBuilder::new(layer)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();

        for entry in walker {
            cancel.check("diff")?;
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(layer)
                .map_err(|_| {
                    Error::invalid_state(entry.path().display().to_string(), "outside of layer")
                })?
                .to_path_buf();
            let metadata = entry.path().symlink_metadata()?;

            if is_overlay_whiteout(&metadata) {
                remove_subtree(&mut tree, &relative);
                continue;
            }
            if is_socket(&metadata) {
                continue;
            }

            let dir = metadata.is_dir();
            if !dir && tree.get(&relative).is_some_and(|node| node.dir) {
                remove_subtree(&mut tree, &relative);
            }
            tree.insert(
                relative,
                Node {
                    source: entry.path().to_path_buf(),
                    dir,
                },
            );
        }
    }

    Ok(tree)
}

/// Remove `root` and every path below it.
fn remove_subtree(tree: &mut Tree, root: &Path) {
    let doomed: Vec<PathBuf> = tree
        .range(root.to_path_buf()..)
        .take_while(|(path, _)| path.starts_with(root))
        .map(|(path, _)| path.clone())
        .collect();
    for path in doomed {
        tree.remove(&path);
    }
}

/// Write the changes from `lower` to `upper` to `out` as a tar stream.
pub(crate) fn write<W: Write>(lower: &Tree, upper: &Tree, out: W, cancel: &Cancel) -> Result<(W, Changes)> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    let mut changes = Changes::default();

    for path in lower.keys() {
        cancel.check("diff")?;
        if upper.contains_key(path) {
            continue;
        }
        // Covered by the marker of a removed ancestor, or by a replacing file
        let parent = path.parent().unwrap_or(Path::new(""));
        if !parent.as_os_str().is_empty() && !upper.get(parent).is_some_and(|node| node.dir) {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let mut marker = parent.to_path_buf();
        marker.push(format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy()));

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, &marker, io::empty())?;
        changes.removed += 1;
    }

    for (path, node) in upper {
        cancel.check("diff")?;
        match lower.get(path) {
            None => changes.added += 1,
            Some(old) if differs(&old.source, &node.source)? => changes.modified += 1,
            Some(_) => continue,
        }
        builder.append_path_with_name(&node.source, path)?;
    }

    let out = builder.into_inner()?;
    Ok((out, changes))
}

/// Whether two entries differ in type, mode, ownership, link target or bytes.
fn differs(lower: &Path, upper: &Path) -> Result<bool> {
    let a = lower.symlink_metadata()?;
    let b = upper.symlink_metadata()?;
    if a.file_type() != b.file_type() || a.permissions() != b.permissions() || !same_owner(&a, &b) {
        return Ok(true);
    }

    let file_type = b.file_type();
    if file_type.is_symlink() {
        return Ok(fs::read_link(lower)? != fs::read_link(upper)?);
    }
    if file_type.is_file() {
        return Ok(a.len() != b.len() || !same_bytes(lower, upper)?);
    }
    Ok(false)
}

fn same_bytes(a: &Path, b: &Path) -> Result<bool> {
    let mut a = File::open(a)?;
    let mut b = File::open(b)?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Unpack a changeset into `target`.
///
/// Markers delete the named path. With `lower` (the merged parents of an
/// overlay layer), a path that still exists below is hidden with an
/// overlayfs whiteout, which needs the privilege to create device nodes.
pub(crate) fn apply<R: Read>(
    target: &Path,
    reader: R,
    lower: Option<&Tree>,
    cancel: &Cancel,
) -> Result<Changes> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(running_as_root());
    archive.set_overwrite(true);

    let mut changes = Changes::default();

    for entry in archive.entries()? {
        cancel.check("apply")?;
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::invalid_state(
                path.display().to_string(),
                "changeset entry escapes the layer",
            ));
        }

        let marked = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(WHITEOUT_PREFIX))
            .map(|name| path.with_file_name(name));
        if let Some(victim) = marked {
            let dest = target.join(&victim);
            remove_entry(&dest)?;
            if lower.is_some_and(|tree| tree.contains_key(&victim)) {
                make_whiteout(&dest)?;
            }
            changes.removed += 1;
            continue;
        }

        let dest = target.join(&path);
        match dest.symlink_metadata() {
            Ok(existing) => {
                let incoming_dir = entry.header().entry_type().is_dir();
                if existing.is_dir() != incoming_dir {
                    remove_entry(&dest)?;
                }
                changes.modified += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => changes.added += 1,
            Err(e) => return Err(e.into()),
        }

        if !entry.unpack_in(target)? {
            return Err(Error::invalid_state(
                path.display().to_string(),
                "changeset entry escapes the layer",
            ));
        }
    }

    Ok(changes)
}

fn remove_entry(path: &Path) -> Result<()> {
    let result = match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn is_overlay_whiteout(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    metadata.file_type().is_char_device() && metadata.rdev() == 0
}

#[cfg(not(unix))]
fn is_overlay_whiteout(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn is_socket(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_socket(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn same_owner(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.uid() == b.uid() && a.gid() == b.gid() && a.rdev() == b.rdev()
}

#[cfg(not(unix))]
fn same_owner(_a: &fs::Metadata, _b: &fs::Metadata) -> bool {
    true
}

#[cfg(unix)]
fn make_whiteout(path: &Path) -> Result<()> {
    use nix::sys::stat::{Mode, SFlag, mknod};
    mknod(path, SFlag::S_IFCHR, Mode::empty(), 0).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_whiteout(path: &Path) -> Result<()> {
    Err(Error::invalid_state(
        path.display().to_string(),
        "overlay whiteouts are not supported on this platform",
    ))
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
