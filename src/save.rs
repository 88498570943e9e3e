//! Writing the tree back into the archive file.
//!
//! The archive is moved to its backup path and a new archive is written in its place: first all
//! entries of the old archive that still exist, in their old order, then everything new.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use anyhow::{format_err, Context, Error};

use archivefs_store::{ArchiveReader, ArchiveWriter, Entry, EntryKind};

use crate::fs::State;
use crate::materialize::remove_backing;
use crate::options::MountOptions;
use crate::path;
use crate::tree::{Node, NodeId, NodeTree};

/// What was written for a node.
struct Written {
    id: NodeId,
    path: String,
    size: u64,
}

/// Name `node` is stored under in the new archive.
fn output_path(tree: &NodeTree, node: &Node) -> String {
    if node.namechanged || !node.in_archive {
        tree.archive_name(&node.name)
    } else {
        node.entry.path.clone()
    }
}

/// Header for `node` as it goes into the new archive.
fn output_entry(tree: &NodeTree, node: &Node) -> Entry {
    let mut entry = node.entry.clone();
    entry.path = output_path(tree, node);
    if let EntryKind::Hardlink(target) = &mut entry.kind {
        // must match the spelling the target itself is written with
        *target = match tree.lookup(target) {
            Some(id) => output_path(tree, &tree[id]),
            None => tree.archive_name(target),
        };
        entry.size = 0;
    }
    if !entry.is_file() {
        entry.size = 0;
    }
    entry
}

fn write_backing<W: Write>(
    writer: &mut ArchiveWriter<W>,
    mut entry: Entry,
    node: &Node,
) -> Result<Entry, Error> {
    let location = node
        .location
        .as_ref()
        .ok_or_else(|| format_err!("{:?} has no backing file", node.name))?;
    let file = File::open(location)
        .with_context(|| format!("unable to open backing file {:?}", location))?;
    entry.size = file.metadata()?.len();
    writer.write_entry(&entry, &mut file.take(entry.size))?;
    Ok(entry)
}

/// Write everything of `node` that does not come from the old archive's data stream.
fn write_node<W: Write>(
    writer: &mut ArchiveWriter<W>,
    reader: &ArchiveReader,
    tree: &NodeTree,
    node: &Node,
) -> Result<Entry, Error> {
    let mut entry = output_entry(tree, node);
    if !entry.is_file() {
        writer.write_entry(&entry, &mut io::empty())?;
        return Ok(entry);
    }
    if node.location.is_some() {
        return write_backing(writer, entry, node);
    }

    if node.in_archive {
        let found = reader.find_entry(&node.entry.path, |old, data| -> Result<(), Error> {
            entry.size = if old.is_file() { old.size } else { 0 };
            writer.write_entry(&entry, data)?;
            Ok(())
        })?;
        if found.is_some() {
            return Ok(entry);
        }
    }
    entry.size = 0;
    writer.write_entry(&entry, &mut io::empty())?;
    Ok(entry)
}

/// Rewrite the archive named in `options` from `state.tree`.
///
/// On failure the original archive stays at the backup path, `state` keeps reading from it and
/// refuses further changes.
pub(crate) fn save_archive(options: &MountOptions, state: &mut State) -> Result<(), Error> {
    let format = state.format.rewrite_format()?;
    let compression = state.compression.rewrite();
    let archive = &options.archive;
    let backup = options.backup_path();
    let mode = state.archive.metadata()?.permissions().mode() & 0o7777;

    log::debug!(
        "saving {:?} as {} ({} compression), backup {:?}",
        archive,
        format,
        compression,
        backup
    );

    std::fs::rename(archive, &backup)
        .with_context(|| format!("unable to move {:?} to {:?}", archive, backup))?;
    state.save_failed = true;

    let result: Result<Vec<Written>, Error> = proxmox_lang::try_block!({
        state.archive = File::open(&backup)
            .with_context(|| format!("unable to open backup {:?}", backup))?;

        let output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(archive)
            .with_context(|| format!("unable to create {:?}", archive))?;
        let mut writer = ArchiveWriter::new(BufWriter::new(output), format, compression)?;

        let tree = &state.tree;
        let reader = ArchiveReader::with_format(&state.archive, state.format, state.compression);
        let index = tree.entry_index();
        let mut seen = HashSet::new();
        let mut written_names = HashSet::new();
        let mut written = Vec::new();

        reader.for_each_entry(|old, data| -> Result<ControlFlow<()>, Error> {
            let name = path::canonicalize(&old.path);
            let id = match index.get(&name) {
                Some(id) => *id,
                None => {
                    log::warn!("dropping removed entry {:?}", old.path);
                    return Ok(ControlFlow::Continue(()));
                }
            };
            if seen.contains(&id) {
                return Ok(ControlFlow::Continue(()));
            }
            let node = &tree[id];
            if let EntryKind::Hardlink(target) = &node.entry.kind {
                if !written_names.contains(target) {
                    // written with the new nodes, after its target
                    return Ok(ControlFlow::Continue(()));
                }
            }
            seen.insert(id);

            let mut entry = output_entry(tree, node);
            if entry.is_file() && node.location.is_some() {
                entry = write_backing(&mut writer, entry, node)?;
            } else if entry.is_file() && old.is_file() {
                entry.size = old.size;
                writer.write_entry(&entry, data)?;
            } else {
                entry.size = 0;
                writer.write_entry(&entry, &mut io::empty())?;
            }
            written_names.insert(node.name.clone());
            written.push(Written {
                id,
                path: entry.path,
                size: entry.size,
            });
            Ok(ControlFlow::Continue(()))
        })?;

        let (links, others): (Vec<NodeId>, Vec<NodeId>) = tree
            .preorder()
            .into_iter()
            .filter(|id| *id != tree.root() && !seen.contains(id))
            .filter(|id| tree[*id].modified || tree[*id].in_archive)
            .partition(|id| matches!(tree[*id].entry.kind, EntryKind::Hardlink(_)));

        for id in others.into_iter().chain(links) {
            let entry = write_node(&mut writer, &reader, tree, &tree[id])?;
            written.push(Written {
                id,
                path: entry.path,
                size: entry.size,
            });
        }

        let output = writer.finish()?;
        let output = output.into_inner().map_err(|err| err.into_error())?;
        output.sync_all()?;

        state.archive = File::open(archive)
            .with_context(|| format!("unable to reopen {:?}", archive))?;
        Ok(written)
    });

    let written = match result {
        Ok(written) => written,
        Err(err) => {
            log::error!(
                "writing {:?} failed, the original archive is kept at {:?}: {}",
                archive,
                backup,
                err
            );
            return Err(err);
        }
    };

    state.format = format;
    state.compression = compression;
    for Written { id, path, size } in written {
        let node = &mut state.tree[id];
        if let Some(location) = node.location.take() {
            if let Err(err) = remove_backing(&location) {
                log::warn!("unable to remove temporary file {:?}: {}", location, err);
            }
        }
        node.entry.path = path;
        if node.entry.is_file() {
            node.entry.size = size;
        }
        node.modified = false;
        node.namechanged = false;
        node.in_archive = true;
    }
    state.modified = false;
    state.save_failed = false;

    if options.nobackup {
        if let Err(err) = std::fs::remove_file(&backup) {
            log::warn!("unable to remove backup {:?}: {}", backup, err);
        }
    }

    log::debug!("saved {:?}", archive);
    Ok(())
}
