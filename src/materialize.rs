//! Copy-on-write backing files for modified and new nodes.
//!
//! Every mount owns a private temporary directory. Content of a node lives in the archive until
//! it is first modified, then in a file in that directory until the archive is rewritten.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{self, Gid, Group, Uid, User};

use archivefs_store::{ArchiveReader, Entry};

use crate::tree::{NodeId, NodeTree};

const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Longest node name part used in temporary file names.
const MAX_NAME_PART: usize = 200;

pub struct TempArea {
    dir: PathBuf,
    keep: bool,
}

impl TempArea {
    /// Create a fresh private directory below `base`, or the system temp directory.
    pub fn new(base: Option<&Path>) -> Result<Self, Error> {
        let base = match base {
            Some(base) => base.to_path_buf(),
            None => std::env::temp_dir(),
        };
        let dir = tempfile::Builder::new()
            .prefix("archivefs_")
            .tempdir_in(&base)
            .with_context(|| format!("unable to create temporary directory in {:?}", base))?
            .into_path();
        Ok(Self { dir, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Leave the directory in place when dropped.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// Name prefix for the node at canonical path `name`, e.g. `archivefs_dir_file_`.
    fn prefix(name: &str) -> String {
        let mut mangled = format!("archivefs{}", name.replace('/', "_"));
        if mangled.len() > MAX_NAME_PART {
            let mut end = MAX_NAME_PART;
            while !mangled.is_char_boundary(end) {
                end -= 1;
            }
            mangled.truncate(end);
        }
        mangled.push('_');
        mangled
    }

    /// `mkstemp` template for the node at canonical path `name`.
    fn template(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}XXXXXX", Self::prefix(name)))
    }

    /// Create a new, empty backing file for `name`.
    pub fn create_file(&self, name: &str) -> Result<(File, PathBuf), Error> {
        let template = self.template(name);
        let (fd, path) = unistd::mkstemp(&template)
            .with_context(|| format!("mkstemp {:?} failed", template))?;
        let file = unsafe { File::from_raw_fd(fd) };
        Ok((file, path))
    }

    pub fn create_dir(&self, name: &str) -> Result<PathBuf, Error> {
        let dir = tempfile::Builder::new()
            .prefix(&Self::prefix(name))
            .tempdir_in(&self.dir)
            .with_context(|| format!("unable to create directory for {:?}", name))?;
        Ok(dir.into_path())
    }

    /// Create a fifo or device node for `name`.
    pub fn create_node(
        &self,
        name: &str,
        kind: SFlag,
        perm: Mode,
        rdev: u64,
    ) -> Result<PathBuf, Error> {
        let (file, path) = self.create_file(name)?;
        drop(file);
        unistd::unlink(&path)?;
        nix::sys::stat::mknod(&path, kind, perm, rdev)
            .with_context(|| format!("mknod {:?} failed", path))?;
        Ok(path)
    }
}

impl Drop for TempArea {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            log::warn!("unable to remove temporary directory {:?}: {}", self.dir, err);
        }
    }
}

/// Remove a backing file, directory or device node.
pub fn remove_backing(path: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    }
}

pub(crate) fn user_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

pub(crate) fn group_name(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
}

/// Update size, modification time and ownership of `entry` from its backing file. The
/// permissions stay what the entry says.
pub fn refresh_stat(entry: &mut Entry, location: &Path) -> Result<(), Error> {
    let metadata = std::fs::symlink_metadata(location)
        .with_context(|| format!("unable to stat {:?}", location))?;
    if entry.is_file() {
        entry.size = metadata.size();
    }
    entry.mtime = metadata.mtime();
    entry.uid = metadata.uid();
    entry.gid = metadata.gid();
    entry.uname = user_name(entry.uid);
    entry.gname = group_name(entry.gid);
    Ok(())
}

/// Copy up to `limit` bytes of the archive entry `entry_path` to the start of `dest`.
pub fn copy_from_archive(
    reader: &ArchiveReader,
    entry_path: &str,
    dest: &File,
    limit: u64,
) -> Result<u64, Error> {
    let copied = reader.find_entry(entry_path, |_, data| -> Result<u64, Error> {
        let mut data = data.take(limit);
        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let got = match data.read(&mut buffer) {
                Ok(0) => break,
                Ok(got) => got,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            dest.write_all_at(&buffer[..got], offset)?;
            offset += got as u64;
        }
        Ok(offset)
    })?;
    copied.ok_or_else(|| format_err!("entry {:?} vanished from the archive", entry_path))
}

/// Give the regular file `id` a backing file unless it already has one.
///
/// Content still in the archive is copied over first, at most `limit` bytes of it. The node is
/// only changed once the copy succeeded.
pub fn materialize(
    temp: &TempArea,
    reader: &ArchiveReader,
    tree: &mut NodeTree,
    id: NodeId,
    limit: Option<u64>,
) -> Result<PathBuf, Error> {
    let node = &tree[id];
    if let Some(location) = &node.location {
        return Ok(location.clone());
    }
    if !node.entry.is_file() {
        io_return!(libc::EINVAL);
    }

    let (file, location) = temp.create_file(&node.name)?;
    if node.in_archive && node.entry.size > 0 {
        let limit = limit.map_or(node.entry.size, |limit| limit.min(node.entry.size));
        if let Err(err) = copy_from_archive(reader, &node.entry.path, &file, limit) {
            let _ = std::fs::remove_file(&location);
            return Err(err);
        }
    }
    drop(file);

    let node = &mut tree[id];
    node.location = Some(location.clone());
    node.modified = true;
    refresh_stat(&mut node.entry, &location)?;
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    use archivefs_store::{ArchiveFormat, ArchiveWriter, Compression, EntryKind};

    fn archive_with(path: &str, data: &[u8]) -> File {
        let mut writer = ArchiveWriter::new(
            tempfile::tempfile().unwrap(),
            ArchiveFormat::Ustar,
            Compression::Gzip,
        )
        .unwrap();
        let mut entry = Entry::new(path, EntryKind::File);
        entry.size = data.len() as u64;
        writer.write_entry(&entry, &mut &data[..]).unwrap();
        let mut file = writer.finish().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn temp_names() {
        let base = tempfile::tempdir().unwrap();
        let temp = TempArea::new(Some(base.path())).unwrap();
        let (_file, path) = temp.create_file("/dir/file.txt").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("archivefs_dir_file.txt_"), "{}", name);
        assert_eq!(path.parent(), Some(temp.path()));

        let long = format!("/{}", "x".repeat(300));
        let (_file, path) = temp.create_file(&long).unwrap();
        assert!(path.file_name().unwrap().len() < 255);

        let dir = temp.create_dir("/new").unwrap();
        assert!(dir.is_dir());
        remove_backing(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn fifo_node() {
        let base = tempfile::tempdir().unwrap();
        let temp = TempArea::new(Some(base.path())).unwrap();
        let path = temp
            .create_node("/pipe", SFlag::S_IFIFO, Mode::from_bits_truncate(0o600), 0)
            .unwrap();
        let metadata = std::fs::symlink_metadata(&path).unwrap();
        assert_eq!(metadata.mode() & libc::S_IFMT, libc::S_IFIFO);
    }

    #[test]
    fn temp_area_is_removed() {
        let base = tempfile::tempdir().unwrap();
        let temp = TempArea::new(Some(base.path())).unwrap();
        let dir = temp.path().to_path_buf();
        temp.create_file("/a").unwrap();
        drop(temp);
        assert!(!dir.exists());
    }

    #[test]
    fn copy_with_limit() {
        let archive = archive_with("data.bin", b"0123456789");
        let reader = ArchiveReader::open(&archive).unwrap();
        let dest = tempfile::tempfile().unwrap();

        assert_eq!(copy_from_archive(&reader, "data.bin", &dest, 4).unwrap(), 4);
        let mut content = Vec::new();
        (&dest).read_to_end(&mut content).unwrap();
        assert_eq!(content, b"0123");

        assert!(copy_from_archive(&reader, "missing", &dest, 4).is_err());
    }

    #[test]
    fn materialize_copies_once() {
        let archive = archive_with("a.txt", b"original!!");
        let reader = ArchiveReader::open(&archive).unwrap();
        let base = tempfile::tempdir().unwrap();
        let temp = TempArea::new(Some(base.path())).unwrap();

        let mut tree = NodeTree::new(Entry::new("", EntryKind::Directory));
        let mut entry = Entry::new("a.txt", EntryKind::File);
        entry.size = 10;
        entry.mode = 0o640;
        let id = tree.insert_archive_entry("/a.txt", entry).unwrap();

        let location = materialize(&temp, &reader, &mut tree, id, None).unwrap();
        assert_eq!(std::fs::read(&location).unwrap(), b"original!!");
        assert!(tree[id].is_modified());
        assert_eq!(tree[id].location(), Some(location.as_path()));
        assert_eq!(tree[id].entry().size, 10);
        assert_eq!(tree[id].entry().mode, 0o640);

        std::fs::write(&location, b"changed").unwrap();
        let again = materialize(&temp, &reader, &mut tree, id, None).unwrap();
        assert_eq!(again, location);
        assert_eq!(std::fs::read(&location).unwrap(), b"changed");

        let dir = tree
            .insert("/d", Entry::new("d", EntryKind::Directory))
            .unwrap();
        let err = materialize(&temp, &reader, &mut tree, dir, None).unwrap_err();
        assert_eq!(crate::errno(&err), libc::EINVAL);
    }
}
