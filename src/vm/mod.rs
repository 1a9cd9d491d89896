//! Virtual machine lifecycle for sandbox-vm.
//!
//! Provides the host data bundle, persisted identity/resource state, resource
//! negotiation, boot loader and device configuration, and the [`Vm`]
//! controller that drives an [`Engine`] through start and stop.

pub mod boot;
pub mod console;
pub mod data_dir;
pub mod devices;
pub mod engine;
pub mod error;
pub mod machine;
pub mod resources;
pub mod state;
pub mod vfkit;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use devices::SharedDirectory;
pub use engine::{Engine, EngineError, Instance, MachineConfig, MachineIdentifier};
pub use error::VmError;
pub use machine::{Vm, VmConfig, VmState};
pub use resources::{Bounds, DEFAULT_CPUS, DEFAULT_DISK_SIZE, DEFAULT_MEMORY};
pub use vfkit::VfkitEngine;
