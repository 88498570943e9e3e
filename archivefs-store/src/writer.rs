use std::io::{Read, Write};

use crate::compression::Encoder;
use crate::cpio::CpioWriter;
use crate::tarball::TarWriter;
use crate::{ArchiveFormat, Compression, Entry, StoreError};

enum Container<W: Write> {
    Tar(TarWriter<Encoder<W>>),
    Cpio(CpioWriter<Encoder<W>>),
}

/// Sequential archive writer.
///
/// Only the formats returned by [`ArchiveFormat::rewrite_format`] can be written.
pub struct ArchiveWriter<W: Write> {
    container: Container<W>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(
        inner: W,
        format: ArchiveFormat,
        compression: Compression,
    ) -> Result<Self, StoreError> {
        let container = match format {
            ArchiveFormat::Ustar | ArchiveFormat::PaxRestricted => {
                Container::Tar(TarWriter::new(Encoder::new(compression, inner)?, false))
            }
            ArchiveFormat::PaxInterchange => {
                Container::Tar(TarWriter::new(Encoder::new(compression, inner)?, true))
            }
            ArchiveFormat::CpioNewc => {
                Container::Cpio(CpioWriter::new(Encoder::new(compression, inner)?, false))
            }
            ArchiveFormat::CpioOdc => {
                Container::Cpio(CpioWriter::new(Encoder::new(compression, inner)?, true))
            }
            other => return Err(StoreError::UnsupportedFormat(other.name())),
        };
        Ok(Self { container })
    }

    /// Write one entry. For regular files exactly `entry.size` bytes are taken from `data`.
    pub fn write_entry(&mut self, entry: &Entry, data: &mut dyn Read) -> Result<(), StoreError> {
        match &mut self.container {
            Container::Tar(writer) => writer.write_entry(entry, data),
            Container::Cpio(writer) => writer.write_entry(entry, data),
        }
    }

    /// Terminate the archive and the compression stream.
    pub fn finish(self) -> Result<W, StoreError> {
        let encoder = match self.container {
            Container::Tar(writer) => writer.finish()?,
            Container::Cpio(writer) => writer.finish()?,
        };
        Ok(encoder.finish()?)
    }
}
