//! Archive entry metadata.

/// What kind of file system object an archive entry describes.
///
/// Link targets are kept as they appear in the archive for symlinks. For hardlinks the
/// target is a path name of another entry in the same archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink(String),
    Hardlink(String),
    CharDevice,
    BlockDevice,
    Fifo,
}

impl EntryKind {
    /// The `S_IFMT` bits for this kind.
    ///
    /// Hardlinks report a regular file, since that is what they refer to in practice.
    pub fn file_type(&self) -> u32 {
        let ty = match self {
            EntryKind::File | EntryKind::Hardlink(_) => libc::S_IFREG,
            EntryKind::Directory => libc::S_IFDIR,
            EntryKind::Symlink(_) => libc::S_IFLNK,
            EntryKind::CharDevice => libc::S_IFCHR,
            EntryKind::BlockDevice => libc::S_IFBLK,
            EntryKind::Fifo => libc::S_IFIFO,
        };
        ty as u32
    }

    /// Map `S_IFMT` bits of a mode back to a kind. Links need a target and are not handled
    /// here.
    pub fn from_file_type(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => Some(EntryKind::File),
            m if m == libc::S_IFDIR as u32 => Some(EntryKind::Directory),
            m if m == libc::S_IFCHR as u32 => Some(EntryKind::CharDevice),
            m if m == libc::S_IFBLK as u32 => Some(EntryKind::BlockDevice),
            m if m == libc::S_IFIFO as u32 => Some(EntryKind::Fifo),
            _ => None,
        }
    }
}

/// Header information of a single archive entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Path name exactly as stored in (or to be written to) the archive.
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits only (`0o7777`), the file type lives in `kind`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: Option<String>,
    pub gname: Option<String>,
    /// Size of the entry's data in bytes. Always 0 for anything but regular files and
    /// symlinks in formats which store the link target as data.
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    /// Inode number, if the format has one (cpio), otherwise 0.
    pub ino: u64,
}

impl Entry {
    pub fn new(path: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            size: 0,
            mtime: 0,
            atime: 0,
            rdev_major: 0,
            rdev_minor: 0,
            ino: 0,
        }
    }

    /// The full `st_mode` value (file type bits and permissions).
    #[inline]
    pub fn st_mode(&self) -> u32 {
        self.kind.file_type() | (self.mode & 0o7777)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    #[inline]
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_device(&self) -> bool {
        matches!(self.kind, EntryKind::CharDevice | EntryKind::BlockDevice)
    }

    /// The link target of symlinks and hardlinks.
    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Symlink(target) | EntryKind::Hardlink(target) => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn st_mode_combines_type_and_permissions() {
        let mut entry = Entry::new("dir/", EntryKind::Directory);
        entry.mode = 0o40755;
        assert_eq!(entry.st_mode(), libc::S_IFDIR as u32 | 0o755);

        let link = Entry::new("a", EntryKind::Hardlink("b".into()));
        assert_eq!(link.st_mode() & libc::S_IFMT as u32, libc::S_IFREG as u32);
        assert_eq!(link.link_target(), Some("b"));
    }

    #[test]
    fn file_type_round_trip() {
        for kind in [
            EntryKind::File,
            EntryKind::Directory,
            EntryKind::CharDevice,
            EntryKind::BlockDevice,
            EntryKind::Fifo,
        ] {
            assert_eq!(EntryKind::from_file_type(kind.file_type() | 0o600), Some(kind));
        }
        assert_eq!(EntryKind::from_file_type(libc::S_IFLNK as u32), None);
    }
}
