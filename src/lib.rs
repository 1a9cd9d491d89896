//! sandbox-vm: provision and run a development virtual machine on the host's
//! native virtualization engine.
//!
//! The [`vm::Vm`] controller owns a VM's data directory, negotiates its CPU
//! and memory against host limits, picks a boot loader, attaches devices and
//! drives an [`vm::Engine`] through start and stop. [`vm::VfkitEngine`] runs
//! machines through `vfkit` on macOS.

pub mod logging;
pub mod vm;
