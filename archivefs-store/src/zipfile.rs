use std::io::{Read, Seek};
use std::ops::ControlFlow;

use crate::{Entry, EntryKind, StoreError};

fn to_epoch(time: zip::DateTime) -> Result<i64, StoreError> {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    tm.tm_year = i32::from(time.year()) - 1900;
    tm.tm_mon = i32::from(time.month()) - 1;
    tm.tm_mday = i32::from(time.day());
    tm.tm_hour = i32::from(time.hour());
    tm.tm_min = i32::from(time.minute());
    tm.tm_sec = i32::from(time.second());
    proxmox_time::timegm(&mut tm)
        .map_err(|err| StoreError::malformed("zip", format!("bad member time: {}", err)))
}

/// Visit the members of a zip archive in central directory order.
pub(crate) fn for_each_entry<R, F, E>(reader: R, mut f: F) -> Result<(), E>
where
    R: Read + Seek,
    F: FnMut(&Entry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
    E: From<StoreError>,
{
    let mut archive = zip::ZipArchive::new(reader).map_err(StoreError::from)?;

    for index in 0..archive.len() {
        let mut member = archive.by_index(index).map_err(StoreError::from)?;
        let path = member.name().to_string();
        let unix_mode = member.unix_mode();

        let kind = if member.is_dir() {
            EntryKind::Directory
        } else if unix_mode.map(|mode| mode & libc::S_IFMT == libc::S_IFLNK) == Some(true) {
            let mut target = String::new();
            member.read_to_string(&mut target).map_err(StoreError::from)?;
            EntryKind::Symlink(target)
        } else {
            EntryKind::File
        };

        let mut entry = Entry::new(path, kind);
        entry.mode = match (unix_mode, entry.is_dir()) {
            (Some(mode), _) => mode & 0o7777,
            (None, true) => 0o755,
            (None, false) => 0o644,
        };
        entry.mtime = to_epoch(member.last_modified())?;
        entry.atime = entry.mtime;
        entry.size = match &entry.kind {
            EntryKind::File => member.size(),
            EntryKind::Symlink(target) => target.len() as u64,
            _ => 0,
        };

        if let ControlFlow::Break(()) = f(&entry, &mut member)? {
            break;
        }
    }

    Ok(())
}
