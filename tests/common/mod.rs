#![allow(dead_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Error;
use flate2::write::GzEncoder;

use archivefs::store::{ArchiveFormat, ArchiveWriter, Compression, Entry, EntryKind};
use archivefs::{ArchiveFs, MountOptions};

pub const MTIME: u64 = 1_600_000_000;

/// One member of a test archive.
pub enum Member<'a> {
    File(&'a str, &'a [u8], u32),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
    Hardlink(&'a str, &'a str),
}

fn tar_header(ty: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(ty);
    header.set_mode(mode);
    header.set_size(size);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_mtime(MTIME);
    header
}

fn append_members<W: Write>(
    builder: &mut tar::Builder<W>,
    members: &[Member],
) -> Result<(), Error> {
    for member in members {
        match member {
            Member::File(path, data, mode) => {
                let mut header = tar_header(tar::EntryType::Regular, *mode, data.len() as u64);
                builder.append_data(&mut header, path, *data)?;
            }
            Member::Dir(path) => {
                let mut header = tar_header(tar::EntryType::Directory, 0o755, 0);
                builder.append_data(&mut header, path, io::empty())?;
            }
            Member::Symlink(path, target) => {
                let mut header = tar_header(tar::EntryType::Symlink, 0o777, 0);
                builder.append_link(&mut header, path, target)?;
            }
            Member::Hardlink(path, target) => {
                let mut header = tar_header(tar::EntryType::Link, 0o644, 0);
                builder.append_link(&mut header, path, target)?;
            }
        }
    }
    Ok(())
}

/// Write a plain ustar archive at `path`.
pub fn write_tar(path: &Path, members: &[Member]) -> Result<(), Error> {
    let mut builder = tar::Builder::new(File::create(path)?);
    append_members(&mut builder, members)?;
    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Write a gzip compressed ustar archive at `path`.
pub fn write_tar_gz(path: &Path, members: &[Member]) -> Result<(), Error> {
    let encoder = GzEncoder::new(File::create(path)?, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_members(&mut builder, members)?;
    builder.into_inner()?.finish()?.sync_all()?;
    Ok(())
}

/// Write an archive through the store's own writer.
pub fn write_archive(
    path: &Path,
    format: ArchiveFormat,
    compression: Compression,
    members: &[Member],
) -> Result<(), Error> {
    let mut writer = ArchiveWriter::new(File::create(path)?, format, compression)?;
    for member in members {
        let (mut entry, data): (Entry, &[u8]) = match member {
            Member::File(path, data, mode) => {
                let mut entry = Entry::new(*path, EntryKind::File);
                entry.mode = *mode;
                entry.size = data.len() as u64;
                (entry, *data)
            }
            Member::Dir(path) => {
                let mut entry = Entry::new(*path, EntryKind::Directory);
                entry.mode = 0o755;
                (entry, &b""[..])
            }
            Member::Symlink(path, target) => {
                let mut entry = Entry::new(*path, EntryKind::Symlink(target.to_string()));
                entry.mode = 0o777;
                (entry, &b""[..])
            }
            Member::Hardlink(path, target) => (
                Entry::new(*path, EntryKind::Hardlink(target.to_string())),
                &b""[..],
            ),
        };
        entry.uid = 1000;
        entry.gid = 1000;
        entry.mtime = MTIME as i64;
        entry.atime = MTIME as i64;
        writer.write_entry(&entry, &mut &data[..])?;
    }
    writer.finish()?.sync_all()?;
    Ok(())
}

/// Options for `archive` with temporary files kept below `dir`.
pub fn options(dir: &Path, archive: &Path) -> MountOptions {
    let tmpdir = dir.join("tmp");
    let _ = std::fs::create_dir(&tmpdir);
    let mut options = MountOptions::new(archive);
    options.tmpdir = Some(tmpdir);
    options
}

pub fn mount(dir: &Path, archive: &Path) -> Result<ArchiveFs, Error> {
    let _ = env_logger::builder().is_test(true).try_init();
    ArchiveFs::mount(options(dir, archive))
}

/// Read the whole content of `path`.
pub fn read_all(fs: &ArchiveFs, path: &str) -> Result<Vec<u8>, Error> {
    let size = fs.getattr(path)?.st_size as usize;
    fs.read(path, size + 1, 0)
}

pub fn names(fs: &ArchiveFs, path: &str) -> Result<Vec<String>, Error> {
    Ok(fs
        .readdir(path)?
        .into_iter()
        .map(|entry| entry.name)
        .filter(|name| name != "." && name != "..")
        .collect())
}

pub fn archive_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
