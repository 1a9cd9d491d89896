//! Host-side data bundle backing one VM.
//!
//! ```text
//! <root>/
//!   boot/default/init     symlink to the guest init (normal boot)
//!   boot/nixos-initrd
//!   boot/nixos-kernel
//!   install/install.sh    bootstrap script (install mode)
//!   disk.img              root disk, fixed size after creation
//!   state.json            persisted identity / cpu / memory
//!   cpu mem id            legacy per-value files, read for migration
//!   log                   append-only host log
//!   nvram                 EFI variable store (install mode)
//! ```
//!
//! A bundle opened without a root lives in a fresh directory under the
//! system temp root and is removed when the [`DataDir`] is dropped.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

const TEMP_PREFIX: &str = "sandboxvm-";

#[derive(Debug)]
pub struct DataDir {
    root: PathBuf,
    temp: Option<TempDir>,
}

impl DataDir {
    /// Open the bundle at `root`, or create a temporary one when `None`.
    ///
    /// The root directory itself is created if missing. Subdirectories are
    /// created on first write.
    pub fn open(root: Option<&Path>) -> io::Result<Self> {
        match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                Ok(Self {
                    root: root.to_path_buf(),
                    temp: None,
                })
            }
            None => {
                let temp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
                debug!(path = %temp.path().display(), "created temporary data directory");
                Ok(Self {
                    root: temp.path().to_path_buf(),
                    temp: Some(temp),
                })
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    pub fn init(&self) -> PathBuf {
        self.root.join("boot").join("default").join("init")
    }

    pub fn initrd(&self) -> PathBuf {
        self.root.join("boot").join("nixos-initrd")
    }

    pub fn kernel(&self) -> PathBuf {
        self.root.join("boot").join("nixos-kernel")
    }

    /// Directory the installer writes its boot artifacts into.
    pub fn boot_output(&self) -> PathBuf {
        self.root.join("boot")
    }

    pub fn bootstrap_script(&self) -> PathBuf {
        self.root.join("install").join("install.sh")
    }

    pub fn disk_image(&self) -> PathBuf {
        self.root.join("disk.img")
    }

    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn legacy_cpu(&self) -> PathBuf {
        self.root.join("cpu")
    }

    pub fn legacy_memory(&self) -> PathBuf {
        self.root.join("mem")
    }

    pub fn legacy_id(&self) -> PathBuf {
        self.root.join("id")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn nvram(&self) -> PathBuf {
        self.root.join("nvram")
    }

    /// Remove a temporary bundle now. Caller-owned bundles are left alone.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.temp.take() {
            Some(temp) => {
                debug!(path = %self.root.display(), "removing temporary data directory");
                temp.close()
            }
            None => Ok(()),
        }
    }
}

/// Create `path` only if it does not exist yet.
///
/// Returns the new file, or `None` when something already exists at `path`.
/// Missing parent directories are created.
pub fn create_exclusive(path: &Path) -> io::Result<Option<File>> {
    let open = || {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    };

    let result = match open() {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            ensure_parent(path)?;
            open()
        }
        other => other,
    };

    match result {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

/// Open `path` for appending, creating it and its parents if needed.
pub fn open_append(path: &Path) -> io::Result<File> {
    let open = || OpenOptions::new().create(true).append(true).open(path);
    match open() {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            ensure_parent(path)?;
            open()
        }
        other => other,
    }
}

pub fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => create_private_dir(parent),
        None => Ok(()),
    }
}

/// `mkdir -p` with owner-only permissions on the directories it creates.
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_relative_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(Some(tmp.path())).unwrap();

        assert!(!dir.is_temporary());
        assert_eq!(dir.init(), tmp.path().join("boot/default/init"));
        assert_eq!(dir.initrd(), tmp.path().join("boot/nixos-initrd"));
        assert_eq!(dir.kernel(), tmp.path().join("boot/nixos-kernel"));
        assert_eq!(dir.bootstrap_script(), tmp.path().join("install/install.sh"));
        assert_eq!(dir.disk_image(), tmp.path().join("disk.img"));
        assert_eq!(dir.legacy_cpu(), tmp.path().join("cpu"));
        assert_eq!(dir.legacy_memory(), tmp.path().join("mem"));
        assert_eq!(dir.legacy_id(), tmp.path().join("id"));
        assert_eq!(dir.log(), tmp.path().join("log"));
        assert_eq!(dir.nvram(), tmp.path().join("nvram"));
    }

    #[test]
    fn open_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested").join("vm");
        let dir = DataDir::open(Some(&root)).unwrap();
        assert!(dir.root().is_dir());
    }

    #[test]
    fn temporary_bundle_is_removed_on_cleanup() {
        let mut dir = DataDir::open(None).unwrap();
        let root = dir.root().to_path_buf();
        assert!(dir.is_temporary());
        assert!(root.is_dir());

        dir.cleanup().unwrap();
        assert!(!root.exists());
        assert!(!dir.is_temporary());
    }

    #[test]
    fn caller_bundle_survives_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = DataDir::open(Some(tmp.path())).unwrap();
        dir.cleanup().unwrap();
        assert!(tmp.path().is_dir());
    }

    #[test]
    fn create_exclusive_only_creates_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a").join("b").join("file");

        assert!(create_exclusive(&path).unwrap().is_some());
        assert!(create_exclusive(&path).unwrap().is_none());
    }

    #[test]
    fn open_append_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("log");
        open_append(&path).unwrap();
        assert!(path.is_file());
    }
}
