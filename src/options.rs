//! Mount configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

/// Suffix of the copy of the archive kept when it is rewritten.
pub const BACKUP_SUFFIX: &str = ".orig";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountOptions {
    /// The archive file to mount.
    pub archive: PathBuf,
    /// Where the file system is mounted. Only used for log messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<PathBuf>,
    /// Never modify the archive.
    #[serde(default)]
    pub readonly: bool,
    /// Remove the `.orig` backup after the archive was rewritten.
    #[serde(default)]
    pub nobackup: bool,
    /// Directory for temporary files, defaults to the system temp directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpdir: Option<PathBuf>,
}

impl MountOptions {
    pub fn new<P: Into<PathBuf>>(archive: P) -> Self {
        Self {
            archive: archive.into(),
            ..Default::default()
        }
    }

    /// Loads mount options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("unable to read mount options from {:?}", path))?;
        let options: MountOptions = serde_json::from_slice(&data)
            .with_context(|| format!("unable to parse mount options in {:?}", path))?;
        Ok(options)
    }

    /// Apply a comma separated, mount(8) style option string.
    ///
    /// Options meant for the host file system layer are returned in order, so they can be
    /// passed on.
    pub fn parse_option_string(&mut self, options: &str) -> Result<Vec<String>, Error> {
        let mut passthrough = Vec::new();
        for option in options.split(',').filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                None if option == "readonly" || option == "ro" => self.readonly = true,
                None if option == "nobackup" => self.nobackup = true,
                Some(("tmpdir", "")) => bail!("option 'tmpdir' needs a directory"),
                Some(("tmpdir", dir)) => self.tmpdir = Some(PathBuf::from(dir)),
                _ => passthrough.push(option.to_string()),
            }
        }
        Ok(passthrough)
    }

    /// Path the original archive is moved to while it is rewritten.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.archive.clone().into_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_string() {
        let mut options = MountOptions::new("/srv/data.tar.gz");
        let rest = options
            .parse_option_string("ro,allow_other,nobackup,tmpdir=/var/tmp,uid=1000")
            .unwrap();
        assert!(options.readonly);
        assert!(options.nobackup);
        assert_eq!(options.tmpdir.as_deref(), Some(Path::new("/var/tmp")));
        assert_eq!(rest, vec!["allow_other", "uid=1000"]);

        assert!(options.parse_option_string("tmpdir=").is_err());
    }

    #[test]
    fn backup_name() {
        let options = MountOptions::new("/srv/data.tar.gz");
        assert_eq!(options.backup_path(), Path::new("/srv/data.tar.gz.orig"));
    }

    #[test]
    fn load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount.json");
        std::fs::write(
            &path,
            r#"{ "archive": "/srv/a.tar", "readonly": true, "tmpdir": "/scratch" }"#,
        )
        .unwrap();

        let options = MountOptions::load(&path).unwrap();
        assert_eq!(options.archive, Path::new("/srv/a.tar"));
        assert!(options.readonly);
        assert!(!options.nobackup);
        assert_eq!(options.mountpoint, None);
        assert_eq!(options.tmpdir.as_deref(), Some(Path::new("/scratch")));

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["readonly"], true);
        assert!(json.get("mountpoint").is_none());

        std::fs::write(&path, "{ \"readonly\": true }").unwrap();
        assert!(MountOptions::load(&path).is_err());
    }
}
