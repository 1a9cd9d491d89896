//! Device configuration for the guest: console, network, entropy, storage,
//! virtio-fs shares and platform identity.
//!
//! Each builder is independent and only produces engine configuration (plus
//! whatever files it needs in the bundle); the controller decides the order
//! and attaches the results to its [`MachineConfig`](crate::vm::engine::MachineConfig).

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vm::boot::write_bootstrap_script;
use crate::vm::data_dir::{DataDir, create_exclusive, create_private_dir};
use crate::vm::engine::{
    DirectoryShare, EngineError, EntropyDevice, MacAddress, MachineIdentifier, NetworkAttachment,
    NetworkDevice, Platform, SerialPort, StorageDevice,
};
use crate::vm::state::StateStore;

/// A host directory to share with the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDirectory {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl SharedDirectory {
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
        }
    }
}

// ---------------------------------------------------------------------------
// Console / network / entropy
// ---------------------------------------------------------------------------

/// Serial console on the host's stdin/stdout. The caller is responsible for
/// holding a [`RawMode`](crate::vm::console::RawMode) guard while it is
/// attached.
pub fn console_device() -> SerialPort {
    SerialPort::Stdio
}

/// NAT networking with a fresh locally-administered MAC address.
pub fn network_device() -> NetworkDevice {
    let mac = MacAddress::random_locally_administered();
    debug!(%mac, "configured nat network device");
    NetworkDevice {
        attachment: NetworkAttachment::Nat,
        mac,
    }
}

pub fn entropy_device() -> EntropyDevice {
    EntropyDevice
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Create the root disk image if it does not exist yet.
///
/// A new image is sized to `size` bytes (sparse). An existing image is opened
/// as-is and never truncated or resized. Returns whether the image was created.
pub fn create_root_disk(path: &Path, size: u64) -> io::Result<bool> {
    match create_exclusive(path)? {
        Some(file) => {
            file.set_len(size)
                .map_err(|e| io::Error::new(e.kind(), format!("truncate new root disk image: {e}")))?;
            debug!(path = %path.display(), size, "created root disk image");
            Ok(true)
        }
        None => {
            debug!(path = %path.display(), "using existing root disk image");
            Ok(false)
        }
    }
}

/// Root disk, followed by the read-only installer image in install mode.
pub fn storage_devices(
    dir: &DataDir,
    disk_size: u64,
    installer_image: Option<&Path>,
) -> io::Result<Vec<StorageDevice>> {
    let root = dir.disk_image();
    create_root_disk(&root, disk_size)
        .map_err(|e| io::Error::new(e.kind(), format!("create root disk: {e}")))?;

    let mut disks = vec![StorageDevice {
        path: root,
        read_only: false,
    }];

    if let Some(image) = installer_image {
        if !image.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("create installer disk: no installer image at {}", image.display()),
            ));
        }
        disks.push(StorageDevice {
            path: image.to_path_buf(),
            read_only: true,
        });
    }
    Ok(disks)
}

// ---------------------------------------------------------------------------
// Shared directories
// ---------------------------------------------------------------------------

/// The virtiofs tag for a share: the base name of its host path.
pub fn share_tag(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "host".to_string())
}

pub fn directory_share(dir: &SharedDirectory) -> DirectoryShare {
    let tag = share_tag(&dir.path);
    debug!(dir = %dir.path.display(), %tag, readonly = dir.read_only, "configured shared directory");
    DirectoryShare {
        tag,
        path: dir.path.clone(),
        read_only: dir.read_only,
    }
}

/// The two shares an installer guest needs, in order: the read-only
/// bootstrap script directory and the writable boot-output directory.
pub fn install_shares(dir: &DataDir, system: &str) -> io::Result<[SharedDirectory; 2]> {
    let bootstrap = write_bootstrap_script(dir, system)
        .map_err(|e| io::Error::new(e.kind(), format!("generate bootstrap files: {e}")))?;
    let boot_output = dir.boot_output();
    create_private_dir(&boot_output)?;
    Ok([
        SharedDirectory::new(bootstrap, true),
        SharedDirectory::new(boot_output, false),
    ])
}

/// Implicit shares (if any) first, then the caller's, one device each.
pub fn directory_shares(implicit: &[SharedDirectory], caller: &[SharedDirectory]) -> Vec<DirectoryShare> {
    implicit.iter().chain(caller).map(directory_share).collect()
}

// ---------------------------------------------------------------------------
// Platform identity
// ---------------------------------------------------------------------------

/// Where the identity for this start came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Persisted,
    Generated,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("create machine identifier: {0}")]
    Generate(#[source] EngineError),
    #[error("load machine identifier: {0}")]
    Load(#[source] EngineError),
    #[error("save machine identifier: {0}")]
    Save(#[source] io::Error),
}

/// Reuse the persisted identity, or generate and persist a new one before
/// using it.
pub fn platform(
    store: &StateStore,
    generate: impl FnOnce() -> Result<MachineIdentifier, EngineError>,
    restore: impl FnOnce(&[u8]) -> Result<MachineIdentifier, EngineError>,
) -> Result<(Platform, IdentitySource), IdentityError> {
    let (machine_identifier, source) = match store.machine_id() {
        Some(bytes) => {
            let id = restore(&bytes).map_err(IdentityError::Load)?;
            debug!("loaded machine identifier");
            (id, IdentitySource::Persisted)
        }
        None => {
            let id = generate().map_err(IdentityError::Generate)?;
            store.save_machine_id(id.as_bytes()).map_err(IdentityError::Save)?;
            debug!("created new machine identifier");
            (id, IdentitySource::Generated)
        }
    };
    Ok((Platform { machine_identifier }, source))
}
