//! Container format and compression detection.

use std::fmt;

use crate::StoreError;

/// Size of the header block sniffed to detect the container format.
pub(crate) const PROBE_SIZE: usize = 512;

/// Bytes read for format detection: a header block and the block after it.
pub(crate) const HEAD_SIZE: usize = 2 * PROBE_SIZE;

/// Container formats we can recognize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Pre-POSIX (v7) tar.
    Tar,
    Ustar,
    GnuTar,
    PaxInterchange,
    PaxRestricted,
    CpioNewc,
    CpioCrc,
    CpioOdc,
    CpioBinary,
    Zip,
    Shar,
    SevenZip,
}

impl ArchiveFormat {
    pub fn name(self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Ustar => "ustar",
            ArchiveFormat::GnuTar => "gnutar",
            ArchiveFormat::PaxInterchange => "pax interchange",
            ArchiveFormat::PaxRestricted => "pax restricted",
            ArchiveFormat::CpioNewc => "cpio newc",
            ArchiveFormat::CpioCrc => "cpio crc",
            ArchiveFormat::CpioOdc => "cpio odc",
            ArchiveFormat::CpioBinary => "cpio binary",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Shar => "shar",
            ArchiveFormat::SevenZip => "7z",
        }
    }

    /// Whether we have a reader for this format.
    pub fn is_readable(self) -> bool {
        !matches!(
            self,
            ArchiveFormat::CpioBinary | ArchiveFormat::Shar | ArchiveFormat::SevenZip
        )
    }

    /// The format a modified archive of this format is written in.
    ///
    /// All tar dialects without pax headers are normalized to ustar, the cpio family to
    /// either newc or odc. Everything else cannot be rewritten.
    pub fn rewrite_format(self) -> Result<ArchiveFormat, StoreError> {
        match self {
            ArchiveFormat::Tar | ArchiveFormat::Ustar | ArchiveFormat::GnuTar => {
                Ok(ArchiveFormat::Ustar)
            }
            ArchiveFormat::PaxRestricted => Ok(ArchiveFormat::PaxRestricted),
            ArchiveFormat::PaxInterchange => Ok(ArchiveFormat::PaxInterchange),
            ArchiveFormat::CpioNewc | ArchiveFormat::CpioCrc => Ok(ArchiveFormat::CpioNewc),
            ArchiveFormat::CpioOdc | ArchiveFormat::CpioBinary => Ok(ArchiveFormat::CpioOdc),
            other => Err(StoreError::UnsupportedFormat(other.name())),
        }
    }

    /// Whether archives of this format can be modified at all.
    pub fn is_writable(self) -> bool {
        self.is_readable() && self.rewrite_format().is_ok()
    }

    pub(crate) fn is_tar(self) -> bool {
        matches!(
            self,
            ArchiveFormat::Tar
                | ArchiveFormat::Ustar
                | ArchiveFormat::GnuTar
                | ArchiveFormat::PaxInterchange
                | ArchiveFormat::PaxRestricted
        )
    }

    pub(crate) fn is_cpio(self) -> bool {
        matches!(
            self,
            ArchiveFormat::CpioNewc | ArchiveFormat::CpioCrc | ArchiveFormat::CpioOdc
        )
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream compression wrapped around the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    /// Unix `compress` (LZW, `.Z`), recognized but not supported.
    Compress,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::Compress => "compress",
        }
    }

    pub fn is_writable(self) -> bool {
        self != Compression::Compress
    }

    /// The compression used when rewriting an archive. Codecs we cannot produce fall back to
    /// an uncompressed container.
    pub fn rewrite(self) -> Compression {
        match self {
            Compression::Compress => Compression::None,
            other => other,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn detect_compression(head: &[u8]) -> Compression {
    if head.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if head.starts_with(b"BZh") {
        Compression::Bzip2
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Compression::Xz
    } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else if head.starts_with(&[0x1f, 0x9d]) {
        Compression::Compress
    } else {
        Compression::None
    }
}

/// Detect the container format from the first (decompressed) bytes of an archive.
///
/// An empty stream, or one starting with an all-zero block, is an empty tar archive.
pub(crate) fn detect_format(head: &[u8]) -> Result<ArchiveFormat, StoreError> {
    if head.iter().all(|b| *b == 0) {
        return Ok(ArchiveFormat::Ustar);
    }

    if head.starts_with(b"070701") {
        return Ok(ArchiveFormat::CpioNewc);
    } else if head.starts_with(b"070702") {
        return Ok(ArchiveFormat::CpioCrc);
    } else if head.starts_with(b"070707") {
        return Ok(ArchiveFormat::CpioOdc);
    } else if head.starts_with(&[0xc7, 0x71]) || head.starts_with(&[0x71, 0xc7]) {
        return Ok(ArchiveFormat::CpioBinary);
    } else if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        return Ok(ArchiveFormat::Zip);
    } else if head.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]) {
        return Ok(ArchiveFormat::SevenZip);
    } else if head.starts_with(b"#!/bin/sh") && head.windows(4).any(|w| w == b"shar") {
        return Ok(ArchiveFormat::Shar);
    }

    if head.len() >= PROBE_SIZE {
        let block = &head[..PROBE_SIZE];
        if &block[257..263] == b"ustar\0" {
            return Ok(match block[156] {
                b'x' => pax_dialect(block, &head[PROBE_SIZE..]),
                b'g' => ArchiveFormat::PaxInterchange,
                _ => ArchiveFormat::Ustar,
            });
        }
        if &block[257..265] == b"ustar  \0" {
            return Ok(ArchiveFormat::GnuTar);
        }
        if tar_checksum_ok(block) {
            return Ok(ArchiveFormat::Tar);
        }
    }

    Err(StoreError::UnknownFormat)
}

/// Tell the pax dialects apart by the first extended header. Interchange archives record the
/// access time of every entry, restricted ones only carry what ustar cannot hold.
fn pax_dialect(header: &[u8], data: &[u8]) -> ArchiveFormat {
    let size = parse_octal(&header[124..136]).unwrap_or(0) as usize;
    if size == 0 || data.len() < size.min(PROBE_SIZE) {
        return ArchiveFormat::PaxInterchange;
    }
    let records = &data[..size.min(data.len())];
    let has_atime = records
        .split(|b| *b == b'\n')
        .filter_map(|record| record.iter().position(|b| *b == b' ').map(|i| &record[i + 1..]))
        .any(|record| record.starts_with(b"atime="));
    if has_atime {
        ArchiveFormat::PaxInterchange
    } else {
        ArchiveFormat::PaxRestricted
    }
}

fn parse_octal(field: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(field).ok()?;
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return None;
    }
    u32::from_str_radix(text, 8).ok()
}

/// Verify the header checksum of a (v7) tar header block.
fn tar_checksum_ok(block: &[u8]) -> bool {
    let stored = match parse_octal(&block[148..156]) {
        Some(sum) => sum,
        None => return false,
    };
    let sum: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if (148..156).contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(*b)
            }
        })
        .sum();
    stored == sum
}
