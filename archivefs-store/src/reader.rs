use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::ControlFlow;

use crate::compression::decoder;
use crate::format::{detect_compression, detect_format, HEAD_SIZE};
use crate::io::FileReader;
use crate::{cpio, tarball, zipfile};
use crate::{ArchiveFormat, Compression, Entry, StoreError};

/// Sequential reader over the entries of an archive file.
///
/// The reader only borrows the file and reads it through `pread`, so any number of readers
/// may walk the same file at the same time. Every call to [`for_each_entry`] starts a fresh
/// pass from the beginning of the archive.
///
/// [`for_each_entry`]: ArchiveReader::for_each_entry
pub struct ArchiveReader<'a> {
    file: &'a File,
    format: ArchiveFormat,
    compression: Compression,
}

fn read_probe<R: Read>(mut reader: R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

impl<'a> ArchiveReader<'a> {
    /// Detect compression and container format of `file`.
    ///
    /// Fails for formats and codecs we recognize but cannot read.
    pub fn open(file: &'a File) -> Result<Self, StoreError> {
        let mut magic = [0u8; 6];
        let len = read_probe(FileReader::new(file), &mut magic)?;
        let compression = detect_compression(&magic[..len]);

        let mut head = [0u8; HEAD_SIZE];
        let len = read_probe(decoder(compression, FileReader::new(file))?, &mut head)?;
        let format = detect_format(&head[..len])?;
        if !format.is_readable() {
            return Err(StoreError::UnsupportedFormat(format.name()));
        }
        if format == ArchiveFormat::Zip && compression != Compression::None {
            return Err(StoreError::UnsupportedCompression(compression.name()));
        }

        log::debug!("archive format {}, compression {}", format, compression);

        Ok(Self {
            file,
            format,
            compression,
        })
    }

    /// Reader for a file whose format was detected before, skipping detection.
    pub fn with_format(file: &'a File, format: ArchiveFormat, compression: Compression) -> Self {
        Self {
            file,
            format,
            compression,
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Walk all entries in archive order.
    ///
    /// `f` gets each entry's header and a reader for its data. The data does not have to be
    /// consumed. Returning `ControlFlow::Break` ends the walk early.
    pub fn for_each_entry<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(&Entry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
        E: From<StoreError>,
    {
        if self.format == ArchiveFormat::Zip {
            return zipfile::for_each_entry(BufReader::new(FileReader::new(self.file)), f);
        }

        let stream = decoder(self.compression, BufReader::new(FileReader::new(self.file)))?;
        if self.format.is_tar() {
            tarball::for_each_entry(stream, f)
        } else if self.format.is_cpio() {
            cpio::for_each_entry(stream, f)
        } else {
            Err(StoreError::UnsupportedFormat(self.format.name()).into())
        }
    }

    /// Find the first entry named `path` and pass its data to `f`.
    ///
    /// Returns `None` if there is no such entry.
    pub fn find_entry<T, F, E>(&self, path: &str, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&Entry, &mut dyn Read) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut f = Some(f);
        let mut result = None;
        self.for_each_entry::<_, E>(|entry, data| {
            if entry.path != path {
                return Ok(ControlFlow::Continue(()));
            }
            if let Some(f) = f.take() {
                result = Some(f(entry, data)?);
            }
            Ok(ControlFlow::Break(()))
        })?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    use crate::{ArchiveWriter, EntryKind};

    fn archive_file(format: ArchiveFormat, compression: Compression) -> File {
        let mut writer = ArchiveWriter::new(tempfile::tempfile().unwrap(), format, compression)
            .unwrap();
        let mut entry = Entry::new("a.txt", EntryKind::File);
        entry.size = 10;
        writer.write_entry(&entry, &mut &b"0123456789"[..]).unwrap();
        let mut entry = Entry::new("b.txt", EntryKind::File);
        entry.size = 2;
        writer.write_entry(&entry, &mut &b"bb"[..]).unwrap();
        let mut file = writer.finish().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn detects_written_archives() {
        for (format, compression) in [
            (ArchiveFormat::Ustar, Compression::None),
            (ArchiveFormat::Ustar, Compression::Gzip),
            (ArchiveFormat::PaxInterchange, Compression::Bzip2),
            (ArchiveFormat::CpioNewc, Compression::Xz),
            (ArchiveFormat::CpioOdc, Compression::Zstd),
        ] {
            let file = archive_file(format, compression);
            let reader = ArchiveReader::open(&file).unwrap();
            assert_eq!(reader.format(), format);
            assert_eq!(reader.compression(), compression);

            let data = reader
                .find_entry::<_, _, StoreError>("b.txt", |_, data| {
                    let mut buf = Vec::new();
                    data.read_to_end(&mut buf)?;
                    Ok(buf)
                })
                .unwrap();
            assert_eq!(data.as_deref(), Some(&b"bb"[..]));

            let missing = reader
                .find_entry::<(), _, StoreError>("c.txt", |_, _| Ok(()))
                .unwrap();
            assert!(missing.is_none());
        }
    }

    #[test]
    fn long_leading_name_keeps_rewrite_format() {
        let long = "n".repeat(300);
        let write = |format: ArchiveFormat| {
            let mut writer =
                ArchiveWriter::new(tempfile::tempfile().unwrap(), format, Compression::None)
                    .unwrap();
            let mut entry = Entry::new(long.as_str(), EntryKind::File);
            entry.size = 4;
            writer.write_entry(&entry, &mut &b"long"[..]).unwrap();
            let mut file = writer.finish().unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file
        };

        // a ustar rewrite needs a pax record for the name and reads back as restricted pax,
        // which is written the same way again
        let file = write(ArchiveFormat::Ustar);
        let reader = ArchiveReader::open(&file).unwrap();
        assert_eq!(reader.format(), ArchiveFormat::PaxRestricted);
        assert_eq!(reader.format().rewrite_format().unwrap(), ArchiveFormat::PaxRestricted);
        let found = reader
            .find_entry::<_, _, StoreError>(&long, |entry, _| Ok(entry.size))
            .unwrap();
        assert_eq!(found, Some(4));

        let file = write(ArchiveFormat::PaxInterchange);
        let reader = ArchiveReader::open(&file).unwrap();
        assert_eq!(reader.format(), ArchiveFormat::PaxInterchange);
    }

    #[test]
    fn empty_file_is_empty_tar() {
        let file = tempfile::tempfile().unwrap();
        let reader = ArchiveReader::open(&file).unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Ustar);
        let mut count = 0;
        reader
            .for_each_entry::<_, StoreError>(|_, _| {
                count += 1;
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn rejects_unknown_data() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"this is just some text, not an archive").unwrap();
        assert!(matches!(
            ArchiveReader::open(&file),
            Err(StoreError::UnknownFormat)
        ));

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"#!/bin/sh\n# This is a shell archive (shar)\n").unwrap();
        assert!(matches!(
            ArchiveReader::open(&file),
            Err(StoreError::UnsupportedFormat("shar"))
        ));
    }
}
