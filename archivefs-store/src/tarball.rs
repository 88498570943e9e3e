//! Tar family reader and ustar/pax writer on top of the `tar` crate.
//!
//! Path names are written byte for byte, so archives with absolute names or `./` prefixes
//! keep their naming convention across a rewrite. The `tar` crate's own path setters reject
//! such names.

use std::io::{self, Read, Write};
use std::ops::ControlFlow;

use tar::{EntryType, Header};

use crate::io::ExactReader;
use crate::{Entry, EntryKind, StoreError};

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn non_empty(bytes: Option<&[u8]>) -> Option<String> {
    bytes.filter(|b| !b.is_empty()).map(lossy)
}

fn pax_atime<R: Read>(item: &mut tar::Entry<R>) -> io::Result<Option<i64>> {
    let extensions = match item.pax_extensions()? {
        Some(extensions) => extensions,
        None => return Ok(None),
    };
    for extension in extensions {
        let extension = extension?;
        if extension.key() == Ok("atime") {
            let value = extension.value().unwrap_or("");
            let seconds = value.split('.').next().unwrap_or("");
            return Ok(seconds.parse().ok());
        }
    }
    Ok(None)
}

fn header_to_entry<R: Read>(item: &mut tar::Entry<R>) -> Result<Option<Entry>, StoreError> {
    let atime = pax_atime(item)?;
    let path = lossy(&item.path_bytes());
    let link = item.link_name_bytes().map(|name| lossy(&name));
    let size = item.size();
    let header = item.header();

    let link_target = || {
        link.clone()
            .ok_or_else(|| StoreError::malformed("tar", format!("link '{}' without target", path)))
    };

    let kind = match header.entry_type() {
        EntryType::Regular | EntryType::Continuous => EntryKind::File,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink(link_target()?),
        EntryType::Link => EntryKind::Hardlink(link_target()?),
        EntryType::Char => EntryKind::CharDevice,
        EntryType::Block => EntryKind::BlockDevice,
        EntryType::Fifo => EntryKind::Fifo,
        other => {
            log::debug!("skipping tar entry '{}' of type {:?}", path, other);
            return Ok(None);
        }
    };

    let mut entry = Entry::new(path, kind);
    entry.mode = header.mode()? & 0o7777;
    entry.uid = header.uid()? as u32;
    entry.gid = header.gid()? as u32;
    entry.uname = non_empty(header.username_bytes());
    entry.gname = non_empty(header.groupname_bytes());
    entry.mtime = header.mtime()? as i64;
    entry.atime = match atime {
        Some(atime) => atime,
        None => header
            .as_gnu()
            .and_then(|gnu| gnu.atime().ok())
            .map(|atime| atime as i64)
            .unwrap_or(entry.mtime),
    };
    entry.size = match &entry.kind {
        EntryKind::File => size,
        EntryKind::Symlink(target) => target.len() as u64,
        _ => 0,
    };
    if entry.is_device() {
        entry.rdev_major = header.device_major()?.unwrap_or(0);
        entry.rdev_minor = header.device_minor()?.unwrap_or(0);
    }

    Ok(Some(entry))
}

/// Visit all entries of a tar stream, passing each entry's data to `f`.
pub(crate) fn for_each_entry<R, F, E>(stream: R, mut f: F) -> Result<(), E>
where
    R: Read,
    F: FnMut(&Entry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
    E: From<StoreError>,
{
    let mut archive = tar::Archive::new(stream);
    let entries = archive.entries().map_err(StoreError::from)?;
    for item in entries {
        let mut item = item.map_err(StoreError::from)?;
        let entry = match header_to_entry(&mut item)? {
            Some(entry) => entry,
            None => continue,
        };
        if let ControlFlow::Break(()) = f(&entry, &mut item)? {
            break;
        }
    }
    Ok(())
}

/// Store `path` in the name (and if needed the ustar prefix) field. Returns `false` if the
/// name does not fit and has to go into a pax record.
fn set_raw_name(header: &mut Header, path: &[u8]) -> bool {
    if path.len() <= NAME_LEN {
        header.as_old_mut().name[..path.len()].copy_from_slice(path);
        return true;
    }

    let split = path.iter().enumerate().position(|(i, b)| {
        *b == b'/'
            && i > 0
            && i <= PREFIX_LEN
            && i + 1 < path.len()
            && path.len() - i - 1 <= NAME_LEN
    });
    if let Some(i) = split {
        if let Some(ustar) = header.as_ustar_mut() {
            ustar.prefix[..i].copy_from_slice(&path[..i]);
            let name = &path[i + 1..];
            ustar.name[..name.len()].copy_from_slice(name);
            return true;
        }
    }

    header.as_old_mut().name.copy_from_slice(&path[..NAME_LEN]);
    false
}

fn set_raw_link_name(header: &mut Header, target: &[u8]) -> bool {
    let len = target.len().min(NAME_LEN);
    header.as_old_mut().linkname[..len].copy_from_slice(&target[..len]);
    target.len() <= NAME_LEN
}

pub(crate) struct TarWriter<W: Write> {
    builder: tar::Builder<W>,
    pax_atime: bool,
}

impl<W: Write> TarWriter<W> {
    /// With `pax_atime` every entry is preceded by a pax header carrying its access time.
    pub fn new(inner: W, pax_atime: bool) -> Self {
        Self {
            builder: tar::Builder::new(inner),
            pax_atime,
        }
    }

    pub fn write_entry(&mut self, entry: &Entry, data: &mut dyn Read) -> Result<(), StoreError> {
        let mut header = Header::new_ustar();
        let mut path = entry.path.clone();
        if entry.is_dir() && !path.ends_with('/') {
            path.push('/');
        }

        let mut pax: Vec<(&str, Vec<u8>)> = Vec::new();
        if self.pax_atime {
            pax.push(("atime", entry.atime.to_string().into_bytes()));
        }
        if !set_raw_name(&mut header, path.as_bytes()) {
            pax.push(("path", path.clone().into_bytes()));
        }

        let (ty, size) = match &entry.kind {
            EntryKind::File => (EntryType::Regular, entry.size),
            EntryKind::Directory => (EntryType::Directory, 0),
            EntryKind::Symlink(target) | EntryKind::Hardlink(target) => {
                if !set_raw_link_name(&mut header, target.as_bytes()) {
                    pax.push(("linkpath", target.clone().into_bytes()));
                }
                match entry.kind {
                    EntryKind::Symlink(_) => (EntryType::Symlink, 0),
                    _ => (EntryType::Link, 0),
                }
            }
            EntryKind::CharDevice => (EntryType::Char, 0),
            EntryKind::BlockDevice => (EntryType::Block, 0),
            EntryKind::Fifo => (EntryType::Fifo, 0),
        };

        header.set_entry_type(ty);
        header.set_size(size);
        header.set_mode(entry.mode & 0o7777);
        header.set_uid(u64::from(entry.uid));
        header.set_gid(u64::from(entry.gid));
        header.set_mtime(entry.mtime.max(0) as u64);
        if let Some(uname) = &entry.uname {
            if let Err(err) = header.set_username(uname) {
                log::warn!("cannot store owner name of '{}': {}", entry.path, err);
            }
        }
        if let Some(gname) = &entry.gname {
            if let Err(err) = header.set_groupname(gname) {
                log::warn!("cannot store group name of '{}': {}", entry.path, err);
            }
        }
        if entry.is_device() {
            header.set_device_major(entry.rdev_major)?;
            header.set_device_minor(entry.rdev_minor)?;
        }
        header.set_cksum();

        if !pax.is_empty() {
            self.builder
                .append_pax_extensions(pax.iter().map(|(key, value)| (*key, &value[..])))?;
        }
        self.builder.append(&header, ExactReader::new(data, size))?;
        Ok(())
    }

    pub fn finish(self) -> Result<W, StoreError> {
        Ok(self.builder.into_inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &[u8]) -> Vec<(Entry, Vec<u8>)> {
        let mut out = Vec::new();
        for_each_entry::<_, _, StoreError>(data, |entry, content| {
            let mut buf = Vec::new();
            content.read_to_end(&mut buf)?;
            out.push((entry.clone(), buf));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        out
    }

    #[test]
    fn writes_names_verbatim() {
        let mut writer = TarWriter::new(Vec::new(), false);

        let mut dir = Entry::new("/abs/dir", EntryKind::Directory);
        dir.mode = 0o755;
        writer.write_entry(&dir, &mut io::empty()).unwrap();

        let mut file = Entry::new("./rel.txt", EntryKind::File);
        file.size = 5;
        file.uid = 1000;
        file.uname = Some("user".into());
        file.mtime = 1_600_000_000;
        writer.write_entry(&file, &mut &b"hello"[..]).unwrap();

        let link = Entry::new("/abs/link", EntryKind::Symlink("../rel.txt".into()));
        writer.write_entry(&link, &mut io::empty()).unwrap();

        let entries = collect(&writer.finish().unwrap());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0.path, "/abs/dir/");
        assert!(entries[0].0.is_dir());
        assert_eq!(entries[0].0.mode, 0o755);

        assert_eq!(entries[1].0.path, "./rel.txt");
        assert_eq!(entries[1].0.uid, 1000);
        assert_eq!(entries[1].0.uname.as_deref(), Some("user"));
        assert_eq!(entries[1].0.mtime, 1_600_000_000);
        assert_eq!(entries[1].1, b"hello");

        assert_eq!(entries[2].0.kind, EntryKind::Symlink("../rel.txt".into()));
        assert_eq!(entries[2].0.size, "../rel.txt".len() as u64);
    }

    #[test]
    fn long_names_and_atime() {
        let long = format!("{}/{}", "d".repeat(120), "f".repeat(90));
        let longer = "x".repeat(300);

        let mut writer = TarWriter::new(Vec::new(), true);
        for path in [&long, &longer] {
            let mut entry = Entry::new(path.as_str(), EntryKind::File);
            entry.size = 2;
            entry.atime = 1234;
            writer.write_entry(&entry, &mut &b"ok"[..]).unwrap();
        }

        let entries = collect(&writer.finish().unwrap());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.path, long);
        assert_eq!(entries[1].0.path, longer);
        assert_eq!(entries[1].0.atime, 1234);
        assert_eq!(entries[1].1, b"ok");
    }
}
