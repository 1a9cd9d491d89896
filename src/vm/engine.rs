//! Boundary between the lifecycle controller and the host virtualization
//! engine.
//!
//! The controller never talks to a hypervisor directly. It assembles a
//! [`MachineConfig`] and hands it to an [`Engine`], which validates it and
//! produces an [`Instance`] that can be started and stopped.
//!
//! ```text
//! Vm::start
//!     └─► MachineConfig { boot_loader, cpus, memory, devices… }
//!             ├─► Engine::validate
//!             └─► Engine::instantiate ─► Instance::start
//! Vm::stop
//!     └─► Instance::request_stop  (falls back to Instance::stop)
//! ```

use std::fmt;
use std::path::PathBuf;

use rand::Rng;

use crate::vm::resources::Bounds;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failure reported by the virtualization engine.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// The host's hardware-virtualization capability.
pub trait Engine {
    /// A machine built from a validated configuration.
    type Instance: Instance + Send + Sync + 'static;

    /// Inclusive range of vCPU counts the host allows.
    fn cpu_bounds(&self) -> Bounds<u32>;

    /// Inclusive range of guest memory sizes (bytes) the host allows.
    fn memory_bounds(&self) -> Bounds<u64>;

    /// Check a fully assembled configuration. `Ok(false)` means the engine
    /// looked at it and refused; `Err` means it could not check at all.
    fn validate(&self, config: &MachineConfig) -> Result<bool, EngineError>;

    /// Build a machine from a configuration that passed [`Engine::validate`].
    fn instantiate(&self, config: &MachineConfig) -> Result<Self::Instance, EngineError>;

    /// Generate a fresh platform identity.
    fn new_machine_identifier(&self) -> Result<MachineIdentifier, EngineError> {
        Ok(MachineIdentifier::random())
    }

    /// Rebuild a platform identity from its persisted bytes.
    fn machine_identifier_from_bytes(&self, bytes: &[u8]) -> Result<MachineIdentifier, EngineError> {
        MachineIdentifier::from_bytes(bytes)
    }
}

/// A machine instance owned by the controller while it runs.
///
/// Implementations serialize their own internal operations; the controller
/// calls `request_stop` and `stop` from a blocking worker thread.
pub trait Instance {
    fn start(&self) -> Result<(), EngineError>;

    /// Ask the guest to shut down. `Ok(false)` means the engine rejected the
    /// request in its current state.
    fn request_stop(&self) -> Result<bool, EngineError>;

    /// Stop the machine immediately.
    fn stop(&self) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Configuration model
// ---------------------------------------------------------------------------

/// How the guest begins execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    /// Direct kernel boot.
    Linux {
        kernel: PathBuf,
        initrd: PathBuf,
        command_line: String,
    },
    /// Firmware boot backed by an EFI variable store.
    Efi {
        variable_store: PathBuf,
        /// The store file was just created and must be initialized.
        create_variable_store: bool,
    },
}

/// Bidirectional serial console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPort {
    /// The host process's standard input and output.
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAttachment {
    Nat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub attachment: NetworkAttachment,
    pub mac: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntropyDevice;

/// A disk image attached as a virtio block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub path: PathBuf,
    pub read_only: bool,
}

/// A host directory exposed through virtio-fs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryShare {
    pub tag: String,
    pub path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub machine_identifier: MachineIdentifier,
}

/// Everything the engine needs to build a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub boot_loader: BootLoader,
    pub cpu_count: u32,
    pub memory_size: u64,
    pub serial_ports: Vec<SerialPort>,
    pub network_devices: Vec<NetworkDevice>,
    pub entropy_devices: Vec<EntropyDevice>,
    pub storage_devices: Vec<StorageDevice>,
    pub directory_shares: Vec<DirectoryShare>,
    pub platform: Option<Platform>,
}

impl MachineConfig {
    /// A configuration with a boot loader and resources but no devices.
    pub fn new(boot_loader: BootLoader, cpu_count: u32, memory_size: u64) -> Self {
        Self {
            boot_loader,
            cpu_count,
            memory_size,
            serial_ports: Vec::new(),
            network_devices: Vec::new(),
            entropy_devices: Vec::new(),
            storage_devices: Vec::new(),
            directory_shares: Vec::new(),
            platform: None,
        }
    }
}

// ---------------------------------------------------------------------------
// MAC addresses
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// A random unicast address with the locally-administered bit set.
    pub fn random_locally_administered() -> Self {
        let mut octets: [u8; 6] = rand::thread_rng().r#gen();
        octets[0] = (octets[0] | 0x02) & !0x01;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

// ---------------------------------------------------------------------------
// Machine identifiers
// ---------------------------------------------------------------------------

/// Opaque platform identity. Stable across restarts of the same data
/// directory once persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentifier(Vec<u8>);

impl MachineIdentifier {
    const RANDOM_LEN: usize = 16;

    pub fn random() -> Self {
        let mut bytes = vec![0u8; Self::RANDOM_LEN];
        rand::thread_rng().fill(bytes.as_mut_slice());
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.is_empty() {
            return Err(EngineError::new("machine identifier data is empty"));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddress::random_locally_administered();
            assert!(mac.is_locally_administered(), "{mac}");
            assert!(mac.is_unicast(), "{mac}");
        }
    }

    #[test]
    fn mac_display_is_colon_separated_hex() {
        let mac = MacAddress::new([0x02, 0xab, 0x00, 0x10, 0xff, 0x7e]);
        assert_eq!(mac.to_string(), "02:ab:00:10:ff:7e");
    }

    #[test]
    fn machine_identifier_rejects_empty_data() {
        assert!(MachineIdentifier::from_bytes(&[]).is_err());
        let id = MachineIdentifier::from_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(id.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn random_identifiers_differ() {
        assert_ne!(MachineIdentifier::random(), MachineIdentifier::random());
    }
}
