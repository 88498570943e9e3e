use std::io;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("unrecognized archive format")]
    UnknownFormat,
    #[error("{0} archives are not supported")]
    UnsupportedFormat(&'static str),
    #[error("{0} compression is not supported")]
    UnsupportedCompression(&'static str),
    #[error("malformed {format} archive: {msg}")]
    Malformed { format: &'static str, msg: String },
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl StoreError {
    pub(crate) fn malformed(format: &'static str, msg: impl Into<String>) -> Self {
        StoreError::Malformed {
            format,
            msg: msg.into(),
        }
    }

    /// The POSIX error code a file system operation failing with this error should report.
    pub fn errno(&self) -> i32 {
        match self {
            StoreError::UnknownFormat => libc::EINVAL,
            StoreError::UnsupportedFormat(_) | StoreError::UnsupportedCompression(_) => {
                libc::ENOTSUP
            }
            StoreError::Malformed { .. } | StoreError::Zip(_) => libc::EIO,
            StoreError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
