//! Sequential archive access for archivefs.
//!
//! An archive is read as a stream of [`Entry`] headers, each followed by its data, and written
//! the same way. Container format and compression are detected from the file content.
//!
//! Supported for reading: tar (v7, ustar, GNU, pax), cpio (newc, crc, odc) and zip, each
//! optionally compressed with gzip, bzip2, xz or zstd (zip only uncompressed, it compresses
//! its members itself). Writing supports ustar, pax and cpio newc/odc.

mod compression;
mod cpio;
mod entry;
mod error;
mod format;
mod io;
mod reader;
mod tarball;
mod writer;
mod zipfile;

pub use compression::Encoder;
pub use entry::{Entry, EntryKind};
pub use error::StoreError;
pub use format::{ArchiveFormat, Compression};
pub use io::FileReader;
pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;
