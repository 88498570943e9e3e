//! Portable ASCII cpio: the SVR4 "newc" (and "crc") and the POSIX "odc" variants.
//!
//! Hardlinked files are stored as several entries sharing one inode number. The first one
//! carries the data, later ones are reported as [`EntryKind::Hardlink`] to the first.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;

use crate::{Entry, EntryKind, StoreError};

const NEWC_MAGIC: &[u8] = b"070701";
const CRC_MAGIC: &[u8] = b"070702";
const ODC_MAGIC: &[u8] = b"070707";
const NEWC_HEADER_LEN: usize = 110;
const ODC_HEADER_LEN: usize = 76;
const TRAILER: &str = "TRAILER!!!";
const BLOCK_SIZE: u64 = 512;

#[derive(Default)]
struct RawHeader {
    dev: u64,
    ino: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: i64,
    filesize: u64,
    rdev_major: u32,
    rdev_minor: u32,
    namesize: usize,
}

fn pad4(len: u64) -> u64 {
    (4 - len % 4) % 4
}

fn parse_field(field: &[u8], radix: u32) -> Result<u64, StoreError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|text| u64::from_str_radix(text, radix).ok())
        .ok_or_else(|| {
            StoreError::malformed(
                "cpio",
                format!("bad header field '{}'", String::from_utf8_lossy(field)),
            )
        })
}

fn parse_newc(header: &[u8]) -> Result<RawHeader, StoreError> {
    let field = |n: usize| parse_field(&header[6 + n * 8..6 + (n + 1) * 8], 16);
    Ok(RawHeader {
        ino: field(0)?,
        mode: field(1)? as u32,
        uid: field(2)? as u32,
        gid: field(3)? as u32,
        nlink: field(4)? as u32,
        mtime: field(5)? as i64,
        filesize: field(6)?,
        dev: (field(7)? << 32) | field(8)?,
        rdev_major: field(9)? as u32,
        rdev_minor: field(10)? as u32,
        namesize: field(11)? as usize,
    })
}

fn parse_odc(header: &[u8]) -> Result<RawHeader, StoreError> {
    let octal = |range: std::ops::Range<usize>| parse_field(&header[range], 8);
    let rdev = octal(42..48)?;
    Ok(RawHeader {
        dev: octal(6..12)?,
        ino: octal(12..18)?,
        mode: octal(18..24)? as u32,
        uid: octal(24..30)? as u32,
        gid: octal(30..36)? as u32,
        nlink: octal(36..42)? as u32,
        rdev_major: (rdev >> 8) as u32,
        rdev_minor: (rdev & 0xff) as u32,
        mtime: octal(48..59)? as i64,
        namesize: octal(59..65)? as usize,
        filesize: octal(65..76)?,
    })
}

/// Like `read_exact`, but a clean end of stream before the first byte returns `false`.
fn read_header<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, StoreError> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) if done == 0 => return Ok(false),
            Ok(0) => return Err(StoreError::malformed("cpio", "truncated header")),
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

fn skip<R: Read>(reader: &mut R, count: u64) -> io::Result<()> {
    let skipped = io::copy(&mut reader.take(count), &mut io::sink())?;
    if skipped != count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "unexpected end of cpio archive",
        ));
    }
    Ok(())
}

/// Visit all entries of a cpio stream up to its trailer.
pub(crate) fn for_each_entry<R, F, E>(mut stream: R, mut f: F) -> Result<(), E>
where
    R: Read,
    F: FnMut(&Entry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
    E: From<StoreError>,
{
    let mut inodes: HashMap<(u64, u64), String> = HashMap::new();
    let mut buf = [0u8; NEWC_HEADER_LEN];

    loop {
        if !read_header(&mut stream, &mut buf[..6])? {
            return Ok(());
        }
        let magic = [buf[0], buf[1], buf[2], buf[3], buf[4], buf[5]];
        let (raw, newc) = match &magic[..] {
            magic if magic == NEWC_MAGIC || magic == CRC_MAGIC => {
                if !read_header(&mut stream, &mut buf[6..NEWC_HEADER_LEN])? {
                    return Err(StoreError::malformed("cpio", "truncated header").into());
                }
                (parse_newc(&buf[..NEWC_HEADER_LEN])?, true)
            }
            magic if magic == ODC_MAGIC => {
                if !read_header(&mut stream, &mut buf[6..ODC_HEADER_LEN])? {
                    return Err(StoreError::malformed("cpio", "truncated header").into());
                }
                (parse_odc(&buf[..ODC_HEADER_LEN])?, false)
            }
            _ => return Err(StoreError::malformed("cpio", "bad header magic").into()),
        };

        let mut name = vec![0u8; raw.namesize];
        stream.read_exact(&mut name).map_err(StoreError::from)?;
        if newc {
            skip(&mut stream, pad4((NEWC_HEADER_LEN + raw.namesize) as u64))
                .map_err(StoreError::from)?;
        }
        while name.last() == Some(&0) {
            name.pop();
        }
        let path = String::from_utf8_lossy(&name).into_owned();
        if path == TRAILER {
            return Ok(());
        }
        let data_pad = if newc { pad4(raw.filesize) } else { 0 };

        let kind = match EntryKind::from_file_type(raw.mode) {
            Some(kind) => kind,
            None if raw.mode & libc::S_IFMT == libc::S_IFLNK => {
                let mut target = Vec::new();
                (&mut stream)
                    .take(raw.filesize)
                    .read_to_end(&mut target)
                    .map_err(StoreError::from)?;
                skip(&mut stream, data_pad).map_err(StoreError::from)?;
                EntryKind::Symlink(String::from_utf8_lossy(&target).into_owned())
            }
            None => {
                log::debug!("skipping cpio entry '{}' with mode {:o}", path, raw.mode);
                skip(&mut stream, raw.filesize + data_pad).map_err(StoreError::from)?;
                continue;
            }
        };

        let mut entry = Entry::new(path, kind);
        entry.mode = raw.mode & 0o7777;
        entry.uid = raw.uid;
        entry.gid = raw.gid;
        entry.mtime = raw.mtime;
        entry.atime = raw.mtime;
        entry.ino = raw.ino;
        if entry.is_device() {
            entry.rdev_major = raw.rdev_major;
            entry.rdev_minor = raw.rdev_minor;
        }

        let mut data_len = 0;
        if entry.is_file() {
            let key = (raw.dev, raw.ino);
            match inodes.get(&key) {
                Some(first) if raw.nlink > 1 && raw.filesize == 0 => {
                    entry.kind = EntryKind::Hardlink(first.clone());
                }
                Some(_) => data_len = raw.filesize,
                None => {
                    if raw.ino != 0 {
                        inodes.insert(key, entry.path.clone());
                    }
                    data_len = raw.filesize;
                }
            }
            entry.size = data_len;
        } else if let EntryKind::Symlink(target) = &entry.kind {
            entry.size = target.len() as u64;
        }

        if !matches!(entry.kind, EntryKind::Symlink(_)) {
            let mut data = (&mut stream).take(data_len);
            let flow = f(&entry, &mut data)?;
            io::copy(&mut data, &mut io::sink()).map_err(StoreError::from)?;
            if data.limit() > 0 {
                return Err(StoreError::malformed("cpio", "truncated entry data").into());
            }
            skip(&mut stream, raw.filesize - data_len + data_pad).map_err(StoreError::from)?;
            if let ControlFlow::Break(()) = flow {
                return Ok(());
            }
        } else if let ControlFlow::Break(()) = f(&entry, &mut io::empty())? {
            return Ok(());
        }
    }
}

pub(crate) struct CpioWriter<W: Write> {
    inner: W,
    odc: bool,
    written: u64,
    next_ino: u64,
    inodes: HashMap<String, u64>,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W, odc: bool) -> Self {
        Self {
            inner,
            odc,
            written: 0,
            next_ino: 1,
            inodes: HashMap::new(),
        }
    }

    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        if !self.odc {
            let pad = pad4(self.written) as usize;
            self.put(&[0u8; 4][..pad])?;
        }
        Ok(())
    }

    fn write_header(&mut self, raw: &RawHeader, path: &str) -> Result<(), StoreError> {
        let namesize = path.len() + 1;
        let header = if self.odc {
            let rdev = (u64::from(raw.rdev_major) << 8) | u64::from(raw.rdev_minor);
            if raw.ino > 0o777777 || raw.filesize > 0o77777777777 {
                return Err(StoreError::malformed("cpio", format!("'{}' too large for odc", path)));
            }
            format!(
                "070707{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
                0,
                raw.ino,
                raw.mode,
                raw.uid & 0o777777,
                raw.gid & 0o777777,
                raw.nlink,
                rdev & 0o777777,
                raw.mtime.max(0),
                namesize,
                raw.filesize,
            )
        } else {
            if raw.filesize > u64::from(u32::MAX) {
                return Err(StoreError::malformed("cpio", format!("'{}' too large for newc", path)));
            }
            format!(
                "070701{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
                raw.ino,
                raw.mode,
                raw.uid,
                raw.gid,
                raw.nlink,
                raw.mtime.max(0) as u32,
                raw.filesize,
                0,
                0,
                raw.rdev_major,
                raw.rdev_minor,
                namesize,
                0,
            )
        };
        self.put(header.as_bytes())?;
        self.put(path.as_bytes())?;
        self.put(&[0])?;
        self.pad()?;
        Ok(())
    }

    pub fn write_entry(&mut self, entry: &Entry, data: &mut dyn Read) -> Result<(), StoreError> {
        let mut raw = RawHeader {
            mode: entry.st_mode(),
            uid: entry.uid,
            gid: entry.gid,
            nlink: 1,
            mtime: entry.mtime,
            ..Default::default()
        };

        match &entry.kind {
            EntryKind::Hardlink(target) => match self.inodes.get(target) {
                Some(ino) => {
                    raw.ino = *ino;
                    raw.nlink = 2;
                }
                None => {
                    log::warn!(
                        "hardlink '{}' written before its target '{}', storing an empty file",
                        entry.path,
                        target
                    );
                    raw.ino = self.allocate_ino();
                }
            },
            EntryKind::File => {
                raw.ino = self.allocate_ino();
                raw.filesize = entry.size;
                self.inodes.insert(entry.path.clone(), raw.ino);
            }
            EntryKind::Directory => {
                raw.ino = self.allocate_ino();
                raw.nlink = 2;
            }
            EntryKind::Symlink(target) => {
                raw.ino = self.allocate_ino();
                raw.filesize = target.len() as u64;
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo => {
                raw.ino = self.allocate_ino();
                raw.rdev_major = entry.rdev_major;
                raw.rdev_minor = entry.rdev_minor;
            }
        }

        self.write_header(&raw, &entry.path)?;

        match &entry.kind {
            EntryKind::Symlink(target) => self.put(target.as_bytes())?,
            EntryKind::File => {
                let copied = io::copy(&mut data.take(raw.filesize), &mut self.inner)?;
                self.written += copied;
                if copied != raw.filesize {
                    return Err(StoreError::malformed(
                        "cpio",
                        format!("short data for '{}'", entry.path),
                    ));
                }
            }
            _ => (),
        }
        self.pad()?;
        Ok(())
    }

    fn allocate_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Write the trailer, pad to a full block and return the inner writer.
    pub fn finish(mut self) -> Result<W, StoreError> {
        let trailer = RawHeader {
            nlink: 1,
            ..Default::default()
        };
        self.write_header(&trailer, TRAILER)?;
        let rest = (BLOCK_SIZE - self.written % BLOCK_SIZE) % BLOCK_SIZE;
        io::copy(&mut io::repeat(0).take(rest), &mut self.inner)?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(odc: bool) -> Vec<u8> {
        let mut writer = CpioWriter::new(Vec::new(), odc);

        let mut dir = Entry::new("dir", EntryKind::Directory);
        dir.mode = 0o750;
        writer.write_entry(&dir, &mut io::empty()).unwrap();

        let mut file = Entry::new("dir/file", EntryKind::File);
        file.size = 3;
        file.uid = 42;
        file.mtime = 1_500_000_000;
        writer.write_entry(&file, &mut &b"abc"[..]).unwrap();

        let link = Entry::new("other", EntryKind::Hardlink("dir/file".into()));
        writer.write_entry(&link, &mut io::empty()).unwrap();

        let sym = Entry::new("sym", EntryKind::Symlink("dir/file".into()));
        writer.write_entry(&sym, &mut io::empty()).unwrap();

        let mut fifo = Entry::new("pipe", EntryKind::Fifo);
        fifo.mode = 0o600;
        writer.write_entry(&fifo, &mut io::empty()).unwrap();

        writer.finish().unwrap()
    }

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
    fn newc_and_odc_round_trip() {
        for odc in [false, true] {
            let data = sample(odc);
            assert_eq!(data.len() as u64 % BLOCK_SIZE, 0);
            assert!(data.starts_with(if odc { ODC_MAGIC } else { NEWC_MAGIC }));

            let entries = collect(&data);
            let paths: Vec<&str> = entries.iter().map(|(e, _)| e.path.as_str()).collect();
            assert_eq!(paths, ["dir", "dir/file", "other", "sym", "pipe"]);

            assert!(entries[0].0.is_dir());
            assert_eq!(entries[0].0.mode, 0o750);

            assert_eq!(entries[1].0.size, 3);
            assert_eq!(entries[1].0.uid, 42);
            assert_eq!(entries[1].0.mtime, 1_500_000_000);
            assert_eq!(entries[1].1, b"abc");

            assert_eq!(entries[2].0.kind, EntryKind::Hardlink("dir/file".into()));
            assert_eq!(entries[2].0.size, 0);
            assert_eq!(entries[3].0.kind, EntryKind::Symlink("dir/file".into()));
            assert_eq!(entries[4].0.kind, EntryKind::Fifo);
            assert_eq!(entries[4].0.mode, 0o600);
        }
    }

    #[test]
    fn stops_on_break() {
        let data = sample(false);
        let mut seen = 0;
        for_each_entry::<_, _, StoreError>(&data[..], |_, _| {
            seen += 1;
            Ok(ControlFlow::Break(()))
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn rejects_garbage() {
        let result = for_each_entry::<_, _, StoreError>(&b"070701zzzz"[..], |_, _| {
            Ok(ControlFlow::Continue(()))
        });
        assert!(result.is_err());
    }
}
