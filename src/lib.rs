//! Writable file system view of an archive.
//!
//! [`ArchiveFs`] reads the entries of a tar or cpio archive into a [`NodeTree`] once and then
//! serves file system operations on it. Modified files are copied into private temporary files
//! on first write. When the file system is unmounted (or [`ArchiveFs::save`] is called) the whole
//! archive is rewritten from the tree.
//!
//! Operations return [`anyhow::Error`]. The POSIX error code a host file system layer should
//! report for an error is available via [`errno`].

use std::io;

use anyhow::Error;

use archivefs_store::StoreError;

macro_rules! io_return {
    ($errno:expr) => {{
        return Err(::std::io::Error::from_raw_os_error($errno).into());
    }};
}

pub mod builder;
pub mod fs;
pub mod materialize;
pub mod options;
pub mod path;
mod save;
pub mod tree;

pub use fs::{ArchiveFs, DirEntry};
pub use options::MountOptions;
pub use tree::{Node, NodeId, NodeTree};

pub use archivefs_store as store;

/// The POSIX error code to report for `err`.
///
/// The error chain is searched for an `io::Error` carrying an OS error, a store error or an
/// `Errno`. Anything else is `EIO`.
pub fn errno(err: &Error) -> i32 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<io::Error>() {
            if let Some(code) = err.raw_os_error() {
                return code;
            }
        } else if let Some(err) = cause.downcast_ref::<StoreError>() {
            return err.errno();
        } else if let Some(err) = cause.downcast_ref::<nix::errno::Errno>() {
            return *err as i32;
        }
    }
    libc::EIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{format_err, Context};

    fn enoent() -> Result<(), Error> {
        io_return!(libc::ENOENT);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(errno(&enoent().unwrap_err()), libc::ENOENT);

        let err = enoent().context("looking up file").unwrap_err();
        assert_eq!(errno(&err), libc::ENOENT);

        let err = Error::from(StoreError::UnsupportedFormat("shar"));
        assert_eq!(errno(&err), libc::ENOTSUP);

        let err = Error::from(nix::errno::Errno::EACCES).context("mkstemp failed");
        assert_eq!(errno(&err), libc::EACCES);

        assert_eq!(errno(&format_err!("something else")), libc::EIO);
    }
}
