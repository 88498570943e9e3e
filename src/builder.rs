//! Reading an archive into a [`NodeTree`].

use std::fs::File;
use std::ops::ControlFlow;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Error};
use nix::unistd::AccessFlags;

use archivefs_store::{ArchiveFormat, ArchiveReader, Compression, Entry, EntryKind};

use crate::path;
use crate::tree::NodeTree;

/// The tree of an archive together with what we learned about the archive while reading it.
pub struct BuiltTree {
    pub tree: NodeTree,
    pub format: ArchiveFormat,
    pub compression: Compression,
    /// Whether the archive file and its format allow rewriting it.
    pub writable: bool,
}

/// Metadata of the root directory: world writable, owned by us, times and size of the archive.
fn root_entry(archive: &File) -> Result<Entry, Error> {
    let metadata = archive.metadata()?;
    let mut root = Entry::new("", EntryKind::Directory);
    root.mode = 0o777;
    root.uid = nix::unistd::getuid().as_raw();
    root.gid = nix::unistd::getgid().as_raw();
    root.size = metadata.size();
    root.mtime = metadata.mtime();
    root.atime = metadata.atime();
    Ok(root)
}

/// Whether `name` is the current directory marker some archives start with.
fn is_current_dir(name: &str) -> bool {
    name == "." || name == "./"
}

/// Read all entries of `archive` (opened from `archive_path`) into a new tree.
pub fn build_tree(archive_path: &Path, archive: &File) -> Result<BuiltTree, Error> {
    let reader = ArchiveReader::open(archive)
        .with_context(|| format!("unable to open archive {:?}", archive_path))?;
    let format = reader.format();
    let compression = reader.compression();

    let mut tree = NodeTree::new(root_entry(archive)?);
    let mut first = true;
    let mut count = 0usize;

    reader
        .for_each_entry(|entry, _data| -> Result<ControlFlow<()>, Error> {
            if is_current_dir(&entry.path) {
                return Ok(ControlFlow::Continue(()));
            }
            if first {
                tree.set_absolute_names(entry.path.starts_with('/'));
                first = false;
            }

            let name = path::canonicalize(&entry.path);
            if name == "/" {
                return Ok(ControlFlow::Continue(()));
            }

            let mut entry = entry.clone();
            if let EntryKind::Hardlink(target) = &mut entry.kind {
                *target = path::canonicalize(target);
            }
            match tree.insert_archive_entry(&name, entry) {
                Ok(_) => count += 1,
                Err(err) => log::warn!("skipping archive entry {:?}: {}", name, err),
            }
            Ok(ControlFlow::Continue(()))
        })
        .with_context(|| format!("unable to read archive {:?}", archive_path))?;

    let file_writable =
        nix::unistd::access(archive_path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok();
    let writable = file_writable && format.is_writable() && compression.is_writable();

    log::debug!(
        "read {} entries from {:?} ({}, {} compression, {})",
        count,
        archive_path,
        format,
        compression,
        if writable { "writable" } else { "read-only" },
    );

    Ok(BuiltTree {
        tree,
        format,
        compression,
        writable,
    })
}
