//! Stream codecs wrapped around archive containers.

use std::io::{self, Read, Write};

use crate::{Compression, StoreError};

/// Wrap `reader` in a decoder for `compression`.
///
/// Multi-member streams (concatenated gzip/bzip2/xz) are decoded as one.
pub(crate) fn decoder<'a, R: Read + 'a>(
    compression: Compression,
    reader: R,
) -> Result<Box<dyn Read + 'a>, StoreError> {
    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        Compression::Compress => {
            return Err(StoreError::UnsupportedCompression(compression.name()));
        }
    })
}

/// A compressing writer for one of the writable codecs.
pub enum Encoder<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(compression: Compression, inner: W) -> Result<Self, StoreError> {
        Ok(match compression {
            Compression::None => Encoder::Plain(inner),
            Compression::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            Compression::Bzip2 => Encoder::Bzip2(bzip2::write::BzEncoder::new(
                inner,
                bzip2::Compression::default(),
            )),
            Compression::Xz => Encoder::Xz(xz2::write::XzEncoder::new(inner, 6)),
            Compression::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(inner, 0)?),
            Compression::Compress => {
                return Err(StoreError::UnsupportedCompression(compression.name()));
            }
        })
    }

    /// Write the codec trailer and return the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(inner) => Ok(inner),
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Bzip2(enc) => enc.finish(),
            Encoder::Xz(enc) => enc.finish(),
            Encoder::Zstd(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(inner) => inner.write(buf),
            Encoder::Gzip(enc) => enc.write(buf),
            Encoder::Bzip2(enc) => enc.write(buf),
            Encoder::Xz(enc) => enc.write(buf),
            Encoder::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(inner) => inner.flush(),
            Encoder::Gzip(enc) => enc.flush(),
            Encoder::Bzip2(enc) => enc.flush(),
            Encoder::Xz(enc) => enc.flush(),
            Encoder::Zstd(enc) => enc.flush(),
        }
    }
}
