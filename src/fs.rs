//! File system operations on a mounted archive.
//!
//! All operations take the path of the node they act on, as a host file system layer would
//! pass it. Errors carry the POSIX error code to report, see [`errno`](crate::errno).

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockWriteGuard};

use anyhow::{bail, format_err, Context, Error};
use nix::sys::stat::{Mode, SFlag};

use archivefs_store::{ArchiveFormat, ArchiveReader, Compression, Entry, EntryKind};

use crate::builder::build_tree;
use crate::materialize::{
    group_name, materialize, refresh_stat, remove_backing, user_name, TempArea,
};
use crate::options::MountOptions;
use crate::path;
use crate::save::save_archive;
use crate::tree::{NodeId, NodeTree};

/// Maximum number of links followed while resolving a path.
const MAX_LINK_DEPTH: usize = 40;

const STATFS_BLOCK_SIZE: u64 = 4096;
const STATFS_BLOCKS: u64 = 1000 * 1024 * 1024 * 1024 / STATFS_BLOCK_SIZE;
const STATFS_FILES: u64 = 1_000_000_000;
const STATFS_NAME_MAX: u64 = 255;

/// A directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    /// `st_mode` of the entry.
    pub mode: u32,
}

/// Everything the lock protects.
pub(crate) struct State {
    pub tree: NodeTree,
    /// The archive file the tree refers to.
    pub archive: File,
    pub format: ArchiveFormat,
    pub compression: Compression,
    /// Something changed since the archive was last written.
    pub modified: bool,
    /// A save failed after the archive was moved aside.
    pub save_failed: bool,
}

/// A mounted archive.
pub struct ArchiveFs {
    options: MountOptions,
    writable: bool,
    temp: TempArea,
    state: RwLock<State>,
}

fn lookup(tree: &NodeTree, path: &str) -> Result<NodeId, Error> {
    match tree.lookup(path) {
        Some(id) => Ok(id),
        None => io_return!(libc::ENOENT),
    }
}

/// Follow hardlinks, and symlinks if `follow_symlinks` is set, to the node holding the content.
fn redirect(tree: &NodeTree, mut id: NodeId, follow_symlinks: bool) -> Result<NodeId, Error> {
    for _ in 0..MAX_LINK_DEPTH {
        let node = &tree[id];
        let target = match &node.entry.kind {
            EntryKind::Hardlink(target) => target.clone(),
            EntryKind::Symlink(target) if follow_symlinks => {
                path::resolve_link(&node.name, target)
            }
            _ => return Ok(id),
        };
        id = lookup(tree, &target)?;
    }
    io_return!(libc::ELOOP);
}

fn resolve(tree: &NodeTree, path: &str, follow_symlinks: bool) -> Result<NodeId, Error> {
    redirect(tree, lookup(tree, path)?, follow_symlinks)
}

/// Fail unless a node could be added at `path`.
fn check_new(tree: &NodeTree, path: &str) -> Result<(), Error> {
    if tree.lookup(path).is_some() {
        io_return!(libc::EEXIST);
    }
    match tree.lookup(path::parent(path)) {
        Some(parent) if tree[parent].is_dir() => Ok(()),
        Some(_) => io_return!(libc::ENOTDIR),
        None => io_return!(libc::ENOENT),
    }
}

fn to_stat(id: NodeId, entry: &Entry, readonly: bool) -> Result<libc::stat, Error> {
    let nlink = if entry.is_dir() { 2 } else { 1 };

    let mut stat: libc::stat = unsafe { mem::zeroed() };
    stat.st_ino = id.inode();
    stat.st_nlink = nlink;
    stat.st_mode = entry.st_mode();
    if readonly {
        stat.st_mode &= !0o222;
    }
    stat.st_size = i64::try_from(entry.size)
        .map_err(|err| format_err!("size does not fit into st_size field: {}", err))?;
    stat.st_blksize = STATFS_BLOCK_SIZE as _;
    stat.st_blocks = ((entry.size + 511) / 512) as _;
    stat.st_uid = entry.uid;
    stat.st_gid = entry.gid;
    if entry.is_device() {
        stat.st_rdev = nix::sys::stat::makedev(
            u64::from(entry.rdev_major),
            u64::from(entry.rdev_minor),
        );
    }
    stat.st_atime = entry.atime;
    stat.st_mtime = entry.mtime;
    stat.st_ctime = entry.mtime;
    Ok(stat)
}

/// Positioned read of up to `size` bytes. Only the end of the file ends a read early.
fn read_full_at(file: &File, size: usize, offset: u64) -> Result<Vec<u8>, Error> {
    let mut data = vec![0u8; size];
    let mut done = 0;
    while done < size {
        match file.read_at(&mut data[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(got) => done += got,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    data.truncate(done);
    Ok(data)
}

/// Metadata for a node created without a backing file, owned by us.
fn owned_entry(name: String, kind: EntryKind) -> Entry {
    let mut entry = Entry::new(name, kind);
    entry.uid = nix::unistd::geteuid().as_raw();
    entry.gid = nix::unistd::getegid().as_raw();
    entry.uname = user_name(entry.uid);
    entry.gname = group_name(entry.gid);
    entry.mtime = proxmox_time::epoch_i64();
    entry.atime = entry.mtime;
    entry
}

impl ArchiveFs {
    /// Open the archive named in `options` and read it into memory.
    pub fn mount(options: MountOptions) -> Result<Self, Error> {
        let archive = File::open(&options.archive)
            .with_context(|| format!("unable to open archive {:?}", options.archive))?;
        let built = build_tree(&options.archive, &archive)?;
        let temp = TempArea::new(options.tmpdir.as_deref())?;

        log::debug!(
            "mounted {:?}{}, temporary files in {:?}",
            options.archive,
            match &options.mountpoint {
                Some(mountpoint) => format!(" on {:?}", mountpoint),
                None => String::new(),
            },
            temp.path(),
        );

        Ok(Self {
            writable: built.writable,
            temp,
            state: RwLock::new(State {
                tree: built.tree,
                archive,
                format: built.format,
                compression: built.compression,
                modified: false,
                save_failed: false,
            }),
            options,
        })
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Whether modifications are allowed at all.
    pub fn is_writable(&self) -> bool {
        self.writable && !self.options.readonly
    }

    /// Format of the archive currently backing the mount.
    pub fn format(&self) -> ArchiveFormat {
        self.state.read().unwrap().format
    }

    pub fn compression(&self) -> Compression {
        self.state.read().unwrap().compression
    }

    /// Whether there are changes not yet written to the archive.
    pub fn is_modified(&self) -> bool {
        self.state.read().unwrap().modified
    }

    /// Run `f` on the tree while holding the shared lock.
    pub fn with_tree<R>(&self, f: impl FnOnce(&NodeTree) -> R) -> R {
        f(&self.state.read().unwrap().tree)
    }

    /// Take the exclusive lock for a modifying operation.
    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>, Error> {
        if !self.is_writable() {
            io_return!(libc::EROFS);
        }
        let state = self.state.write().unwrap();
        if state.save_failed {
            io_return!(libc::EROFS);
        }
        Ok(state)
    }

    /// Insert a node whose backing (if any) already exists, or clean the backing up again.
    fn add_node(
        &self,
        state: &mut State,
        path: &str,
        entry: Entry,
        location: Option<PathBuf>,
    ) -> Result<libc::stat, Error> {
        let id = match state.tree.insert(path, entry) {
            Ok(id) => id,
            Err(err) => {
                if let Some(location) = &location {
                    let _ = remove_backing(location);
                }
                return Err(err);
            }
        };
        let node = &mut state.tree[id];
        node.location = location;
        node.modified = true;
        state.modified = true;
        to_stat(id, &state.tree[id].entry, false)
    }

    /// Remove a node and its backing. Directories must be empty.
    ///
    /// If other nodes are hardlinks to this file, the first of them takes over the content and
    /// the others are pointed at it.
    fn remove_node(&self, state: &mut State, id: NodeId) -> Result<(), Error> {
        let name = state.tree[id].name.clone();
        let links: Vec<NodeId> = state
            .tree
            .preorder()
            .into_iter()
            .filter(|link| match &state.tree[*link].entry.kind {
                EntryKind::Hardlink(target) => *target == name,
                _ => false,
            })
            .collect();

        if let Some((heir, others)) = links.split_first() {
            let location = if state.tree[id].entry.is_file() {
                let reader =
                    ArchiveReader::with_format(&state.archive, state.format, state.compression);
                Some(materialize(&self.temp, &reader, &mut state.tree, id, None)?)
            } else {
                state.tree[id].location.take()
            };
            let heir_name = state.tree[*heir].name.clone();
            for other in others {
                state.tree[*other].entry.kind = EntryKind::Hardlink(heir_name.clone());
            }

            let mut entry = state.tree[id].entry.clone();
            let heir = &mut state.tree[*heir];
            entry.path = mem::take(&mut heir.entry.path);
            heir.entry = entry;
            heir.location = location;
            heir.modified = true;
            state.tree[id].location = None;
        } else if let Some(location) = &state.tree[id].location {
            if let Err(err) = remove_backing(location) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err).with_context(|| format!("unable to remove {:?}", location));
                }
            }
        }

        state.tree.remove(id)?;
        state.modified = true;
        Ok(())
    }

    pub fn getattr(&self, path: &str) -> Result<libc::stat, Error> {
        let state = self.state.read().unwrap();
        let id = resolve(&state.tree, &path::canonicalize(path), false)?;
        to_stat(id, &state.tree[id].entry, !self.is_writable())
    }

    /// Read up to `size` bytes at `offset`. Short reads only happen at the end of the file.
    pub fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, Error> {
        let state = self.state.read().unwrap();
        let id = resolve(&state.tree, &path::canonicalize(path), true)?;
        let node = &state.tree[id];
        if node.is_dir() {
            io_return!(libc::EISDIR);
        }

        if let Some(location) = &node.location {
            let file = File::open(location)
                .with_context(|| format!("unable to open backing file {:?}", location))?;
            return read_full_at(&file, size, offset);
        }

        if !node.in_archive || !node.entry.is_file() || offset >= node.entry.size {
            return Ok(Vec::new());
        }

        let reader = ArchiveReader::with_format(&state.archive, state.format, state.compression);
        let data = reader.find_entry(&node.entry.path, |_, data| -> Result<Vec<u8>, Error> {
            let skipped = io::copy(&mut (&mut *data).take(offset), &mut io::sink())?;
            let mut buffer = Vec::new();
            if skipped == offset {
                data.take(size as u64).read_to_end(&mut buffer)?;
            }
            Ok(buffer)
        })?;
        data.ok_or_else(|| format_err!("entry {:?} vanished from the archive", node.entry.path))
    }

    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let id = resolve(&state.tree, &path::canonicalize(path), true)?;
        if state.tree[id].is_dir() {
            io_return!(libc::EISDIR);
        }

        let reader = ArchiveReader::with_format(&state.archive, state.format, state.compression);
        let location = materialize(&self.temp, &reader, &mut state.tree, id, None)?;
        let file = OpenOptions::new().write(true).open(&location)?;
        file.write_all_at(data, offset)?;
        refresh_stat(&mut state.tree[id].entry, &location)?;
        state.modified = true;
        Ok(data.len())
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<(), Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let id = resolve(&state.tree, &path::canonicalize(path), true)?;
        if state.tree[id].is_dir() {
            io_return!(libc::EISDIR);
        }

        let reader = ArchiveReader::with_format(&state.archive, state.format, state.compression);
        let location = materialize(&self.temp, &reader, &mut state.tree, id, Some(size))?;
        let file = OpenOptions::new().write(true).open(&location)?;
        file.set_len(size)?;
        refresh_stat(&mut state.tree[id].entry, &location)?;
        state.modified = true;
        Ok(())
    }

    /// Create a regular file.
    pub fn create(&self, path: &str, mode: u32) -> Result<libc::stat, Error> {
        self.mknod(path, libc::S_IFREG | (mode & 0o7777), 0)
    }

    /// Create a regular file, fifo or device node. `mode` carries the file type bits.
    pub fn mknod(&self, path: &str, mode: u32, rdev: u64) -> Result<libc::stat, Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let path = path::canonicalize(path);
        check_new(&state.tree, &path)?;

        let kind = match mode & libc::S_IFMT {
            0 => EntryKind::File,
            ty => match EntryKind::from_file_type(ty) {
                Some(EntryKind::Directory) | None => io_return!(libc::EINVAL),
                Some(kind) => kind,
            },
        };
        let location = match kind {
            EntryKind::File => self.temp.create_file(&path)?.1,
            _ => self.temp.create_node(
                &path,
                SFlag::from_bits_truncate(kind.file_type()),
                Mode::from_bits_truncate(mode & 0o7777),
                rdev,
            )?,
        };

        let mut entry = Entry::new(state.tree.archive_name(&path), kind);
        entry.mode = mode & 0o7777;
        if entry.is_device() {
            entry.rdev_major = nix::sys::stat::major(rdev) as u32;
            entry.rdev_minor = nix::sys::stat::minor(rdev) as u32;
        }
        if let Err(err) = refresh_stat(&mut entry, &location) {
            let _ = remove_backing(&location);
            return Err(err);
        }
        entry.atime = entry.mtime;

        self.add_node(state, &path, entry, Some(location))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<libc::stat, Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let path = path::canonicalize(path);
        check_new(&state.tree, &path)?;

        let location = self.temp.create_dir(&path)?;
        let mut entry = Entry::new(state.tree.archive_name(&path), EntryKind::Directory);
        entry.mode = mode & 0o7777;
        if let Err(err) = refresh_stat(&mut entry, &location) {
            let _ = remove_backing(&location);
            return Err(err);
        }
        entry.atime = entry.mtime;

        self.add_node(state, &path, entry, Some(location))
    }

    pub fn unlink(&self, path: &str) -> Result<(), Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let id = lookup(&state.tree, &path::canonicalize(path))?;
        if state.tree[id].is_dir() {
            io_return!(libc::EISDIR);
        }
        self.remove_node(state, id)
    }

    pub fn rmdir(&self, path: &str) -> Result<(), Error> {
        if path == "." || path.ends_with("/.") {
            io_return!(libc::EINVAL);
        }
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let id = lookup(&state.tree, &path::canonicalize(path))?;
        let node = &state.tree[id];
        if id == state.tree.root() {
            io_return!(libc::EBUSY);
        }
        if !node.is_dir() {
            io_return!(libc::ENOTDIR);
        }
        if !node.children.is_empty() {
            io_return!(libc::ENOTEMPTY);
        }
        self.remove_node(state, id)
    }

    /// Move `from` to `to`, replacing `to` if it exists and is compatible.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let from = path::canonicalize(from);
        let to = path::canonicalize(to);
        let id = lookup(&state.tree, &from)?;
        if from == to {
            return Ok(());
        }
        if id == state.tree.root() || to == "/" {
            io_return!(libc::EBUSY);
        }
        if path::is_descendant(&to, &from) {
            io_return!(libc::EINVAL);
        }

        if let Some(existing) = state.tree.lookup(&to) {
            let source_is_dir = state.tree[id].is_dir();
            let target = &state.tree[existing];
            if target.is_dir() {
                if !source_is_dir {
                    io_return!(libc::EISDIR);
                }
                if !target.children.is_empty() {
                    io_return!(libc::ENOTEMPTY);
                }
            } else if source_is_dir {
                io_return!(libc::ENOTDIR);
            }
            self.remove_node(state, existing)?;
        }

        state.tree.rename(id, &to)?;
        state.modified = true;
        Ok(())
    }

    /// Create a symbolic link at `link` pointing to `target`.
    pub fn symlink(&self, target: &str, link: &str) -> Result<libc::stat, Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let link = path::canonicalize(link);
        check_new(&state.tree, &link)?;

        let mut entry = owned_entry(
            state.tree.archive_name(&link),
            EntryKind::Symlink(target.to_string()),
        );
        entry.mode = 0o777;
        entry.size = target.len() as u64;

        self.add_node(state, &link, entry, None)
    }

    /// Create a hardlink `to` referring to the same file as `from`.
    pub fn link(&self, from: &str, to: &str) -> Result<libc::stat, Error> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let source = lookup(&state.tree, &path::canonicalize(from))?;
        if state.tree[source].is_dir() {
            io_return!(libc::EPERM);
        }
        let to = path::canonicalize(to);
        check_new(&state.tree, &to)?;

        let content = redirect(&state.tree, source, false)?;
        let node = &state.tree[content];
        let mut entry = node.entry.clone();
        entry.path = state.tree.archive_name(&to);
        entry.kind = EntryKind::Hardlink(node.name.clone());

        self.add_node(state, &to, entry, None)?;
        let stat = to_stat(content, &state.tree[content].entry, false)?;
        Ok(stat)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), Error> {
        let mut state = self.write_state()?;
        let id = resolve(&state.tree, &path::canonicalize(path), true)?;
        let node = &mut state.tree[id];
        node.entry.mode = mode & 0o7777;
        node.modified = true;
        state.modified = true;
        Ok(())
    }

    /// Change owner and/or group. Symlinks themselves are changed, hardlinks are followed.
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<(), Error> {
        let mut state = self.write_state()?;
        let id = resolve(&state.tree, &path::canonicalize(path), false)?;
        let node = &mut state.tree[id];
        node.modified = true;
        let entry = &mut node.entry;
        if let Some(uid) = uid {
            entry.uid = uid;
            entry.uname = user_name(uid);
        }
        if let Some(gid) = gid {
            entry.gid = gid;
            entry.gname = group_name(gid);
        }
        state.modified = true;
        Ok(())
    }

    /// Set access and modification time (seconds since the epoch).
    pub fn utime(&self, path: &str, atime: i64, mtime: i64) -> Result<(), Error> {
        let mut state = self.write_state()?;
        let id = resolve(&state.tree, &path::canonicalize(path), true)?;
        let node = &mut state.tree[id];
        node.modified = true;
        let entry = &mut node.entry;
        entry.atime = atime;
        entry.mtime = mtime;
        state.modified = true;
        Ok(())
    }

    /// Fixed capacity figures, archives have no meaningful free space.
    pub fn statfs(&self) -> libc::statvfs {
        let mut stat: libc::statvfs = unsafe { mem::zeroed() };
        stat.f_bsize = STATFS_BLOCK_SIZE as _;
        stat.f_frsize = STATFS_BLOCK_SIZE as _;
        stat.f_blocks = STATFS_BLOCKS as _;
        stat.f_bfree = STATFS_BLOCKS as _;
        stat.f_bavail = STATFS_BLOCKS as _;
        stat.f_files = STATFS_FILES as _;
        stat.f_ffree = STATFS_FILES as _;
        stat.f_favail = STATFS_FILES as _;
        stat.f_namemax = STATFS_NAME_MAX as _;
        if !self.is_writable() {
            stat.f_flag = libc::ST_RDONLY as _;
        }
        stat
    }

    /// List a directory: `.`, `..` and the children in creation order.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let state = self.state.read().unwrap();
        let tree = &state.tree;
        let id = lookup(tree, &path::canonicalize(path))?;
        let node = &tree[id];
        if !node.is_dir() {
            io_return!(libc::ENOTDIR);
        }

        let parent = node.parent.unwrap_or(id);
        let mut entries = Vec::with_capacity(node.children.len() + 2);
        entries.push(DirEntry {
            name: ".".to_string(),
            inode: id.inode(),
            mode: node.entry.st_mode(),
        });
        entries.push(DirEntry {
            name: "..".to_string(),
            inode: parent.inode(),
            mode: tree[parent].entry.st_mode(),
        });
        for child in &node.children {
            let child_node = &tree[*child];
            entries.push(DirEntry {
                name: child_node.leaf_name().to_string(),
                inode: child.inode(),
                mode: child_node.entry.st_mode(),
            });
        }
        Ok(entries)
    }

    pub fn readlink(&self, path: &str) -> Result<String, Error> {
        let state = self.state.read().unwrap();
        let id = lookup(&state.tree, &path::canonicalize(path))?;
        match &state.tree[id].entry.kind {
            EntryKind::Symlink(target) => Ok(target.clone()),
            _ => io_return!(libc::ENOLINK),
        }
    }

    /// Check that `path` exists and, for `flags` opening it for writing, that we may write.
    pub fn open(&self, path: &str, flags: i32) -> Result<(), Error> {
        let state = self.state.read().unwrap();
        lookup(&state.tree, &path::canonicalize(path))?;
        if flags & libc::O_ACCMODE != libc::O_RDONLY && !self.is_writable() {
            io_return!(libc::EROFS);
        }
        Ok(())
    }

    pub fn release(&self, _path: &str) -> Result<(), Error> {
        Ok(())
    }

    pub fn fsync(&self, _path: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Rewrite the archive from the tree now.
    pub fn save(&self) -> Result<(), Error> {
        if !self.is_writable() {
            io_return!(libc::EROFS);
        }
        let mut state = self.state.write().unwrap();
        if state.save_failed {
            bail!(
                "an earlier save failed, the original archive is kept at {:?}",
                self.options.backup_path()
            );
        }
        save_archive(&self.options, &mut state)
    }

    /// Write pending changes back to the archive and release all temporary files.
    ///
    /// If writing fails, the temporary files are kept so the changes can be recovered.
    pub fn unmount(mut self) -> Result<(), Error> {
        if self.is_writable() && self.is_modified() {
            if let Err(err) = self.save() {
                self.temp.keep();
                log::error!(
                    "unable to save {:?}, modified files are kept in {:?}",
                    self.options.archive,
                    self.temp.path()
                );
                return Err(err);
            }
        }
        Ok(())
    }
}
