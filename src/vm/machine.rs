//! VM lifecycle controller.
//!
//! ## Architecture
//!
//! ```text
//! Vm::start
//!     ├─► DataDir::open            (bundle, temporary if no root given)
//!     ├─► VmLog::open              (bundle `log`, falls back to default)
//!     ├─► negotiate cpus / memory  (host bounds + state.json)
//!     ├─► boot loader              (linux, or efi in install mode)
//!     ├─► console, disks, network, entropy, shares, platform
//!     ├─► Engine::validate
//!     └─► Engine::instantiate ─► Instance::start
//!
//! Vm::stop(cancel)
//!     └─► spawn_blocking(request_stop, stop on rejection)
//!             raced against `cancel`
//! ```
//!
//! States: `Unconfigured → Starting → Running → Stopped`, and
//! `Starting → Failed` on any build, validation or start error. `Failed` and
//! `Stopped` are terminal; use a new [`Vm`] on the same data directory to
//! boot again.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{Dispatch, debug, error, info, warn};

use crate::logging::VmLog;
use crate::vm::boot::{efi_boot_loader, linux_boot_loader};
use crate::vm::console::RawMode;
use crate::vm::data_dir::DataDir;
use crate::vm::devices::{
    self, IdentityError, SharedDirectory, console_device, directory_shares, entropy_device,
    install_shares, network_device, storage_devices,
};
use crate::vm::engine::{Engine, EngineError, Instance, MachineConfig, MachineIdentifier};
use crate::vm::error::VmError;
use crate::vm::resources::{DEFAULT_CPUS, DEFAULT_DISK_SIZE, DEFAULT_MEMORY, negotiate};
use crate::vm::state::StateStore;

pub const DEFAULT_OS: &str = "linux";
pub const DEFAULT_ARCH: &str = "aarch64";

/// Caller-settable VM parameters.
///
/// Zero / empty values mean "unset": they are filled from the data directory
/// or from built-in defaults during [`Vm::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// vCPUs. Defaults to the previous run's value, then [`DEFAULT_CPUS`].
    pub cpus: u32,

    /// Guest memory in bytes. Defaults to the previous run's value, then
    /// [`DEFAULT_MEMORY`].
    pub memory: u64,

    /// Root disk size in bytes. Only used when the disk image is first
    /// created; an existing image is never resized.
    pub disk_size: u64,

    /// Guest OS, `linux` unless set. Has no effect on existing VMs.
    pub os: String,

    /// Guest architecture, `aarch64` unless set. Has no effect on existing VMs.
    pub arch: String,

    /// Boot the installer instead of the installed system.
    pub install: bool,

    /// Installer ISO attached read-only in install mode.
    pub installer_image: Option<PathBuf>,

    /// Host directories to share with the guest, in order.
    pub shared_directories: Vec<SharedDirectory>,

    /// Directory holding the VM's state. When unset, a temporary directory is
    /// created on start and removed after the VM stops.
    pub host_data_dir: Option<PathBuf>,
}

impl VmConfig {
    /// Nix system string, e.g. `aarch64-linux`.
    pub fn nix_system(&self) -> String {
        format!("{}-{}", self.arch, self.os)
    }
}

/// Observed lifecycle state of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Created, never started.
    Unconfigured,
    /// `start` is assembling the configuration.
    Starting,
    /// The engine instance is live.
    Running,
    /// Stopped gracefully or forcibly.
    Stopped,
    /// `start` failed; the partial configuration was discarded.
    Failed,
}

type StopTask = JoinHandle<Result<(), VmError>>;

/// A virtual machine driven by one owner.
///
/// `start` and `stop` take `&mut self`, so calls are serialized by the
/// borrow checker.
pub struct Vm<E: Engine> {
    engine: E,
    config: VmConfig,
    state: VmState,
    machine_id: Option<MachineIdentifier>,
    data_dir: Option<DataDir>,
    log: Option<VmLog>,
    logger: Option<Dispatch>,
    machine_config: Option<MachineConfig>,
    instance: Option<Arc<E::Instance>>,
    raw_mode: Option<RawMode>,
    pending_stop: Option<StopTask>,
}

impl<E: Engine> Vm<E> {
    pub fn new(engine: E, config: VmConfig) -> Self {
        Self {
            engine,
            config,
            state: VmState::Unconfigured,
            machine_id: None,
            data_dir: None,
            log: None,
            logger: None,
            machine_config: None,
            instance: None,
            raw_mode: None,
            pending_stop: None,
        }
    }

    /// Log to `dispatch` instead of the bundle's `log` file.
    pub fn with_logger(mut self, dispatch: Dispatch) -> Self {
        self.logger = Some(dispatch);
        self
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Parameters with negotiated values filled in after a start.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn machine_id(&self) -> Option<&MachineIdentifier> {
        self.machine_id.as_ref()
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_ref().map(DataDir::root)
    }

    /// The configuration handed to the engine by the last successful start.
    pub fn machine_config(&self) -> Option<&MachineConfig> {
        self.machine_config.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.instance.is_some()
    }

    /// A graceful stop is still in flight after a cancelled [`Vm::stop`].
    pub fn has_pending_stop(&self) -> bool {
        self.pending_stop.is_some()
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Build the configuration and boot the VM.
    ///
    /// Fails with [`VmError::InvalidState`] unless the VM is
    /// [`VmState::Unconfigured`]. Any other failure leaves it
    /// [`VmState::Failed`] with the host terminal restored.
    pub fn start(&mut self) -> Result<(), VmError> {
        if self.state != VmState::Unconfigured {
            return Err(VmError::InvalidState(self.state));
        }
        self.state = VmState::Starting;

        match self.try_start() {
            Ok(()) => {
                self.state = VmState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = VmState::Failed;
                self.machine_config = None;
                self.instance = None;
                if let Some(mut raw) = self.raw_mode.take() {
                    raw.restore();
                }
                self.in_log_scope(|| error!(error = %e, "virtual machine failed to start"));
                Err(e)
            }
        }
    }

    fn try_start(&mut self) -> Result<(), VmError> {
        let dir = DataDir::open(self.config.host_data_dir.as_deref())
            .map_err(|e| VmError::state_io("create directory for virtual machine data", e))?;

        if self.config.os.is_empty() {
            self.config.os = DEFAULT_OS.to_string();
        }
        if self.config.arch.is_empty() {
            self.config.arch = DEFAULT_ARCH.to_string();
        }

        let log = match &self.logger {
            Some(dispatch) => VmLog::from_dispatch(dispatch.clone()),
            None => VmLog::open(&dir.log()),
        };
        let result = log.in_scope(|| self.configure_and_boot(&dir));

        self.data_dir = Some(dir);
        self.log = Some(log);
        result
    }

    fn configure_and_boot(&mut self, dir: &DataDir) -> Result<(), VmError> {
        let store = StateStore::new(dir);
        self.configure_cpus(&store)?;
        self.configure_memory(&store)?;

        let loader = if self.config.install {
            efi_boot_loader(dir).map_err(|e| VmError::state_io("create boot loader", e))?
        } else {
            linux_boot_loader(dir).map_err(|e| VmError::configuration("create boot loader", e))?
        };

        debug!(cpus = self.config.cpus, memory = self.config.memory, "creating virtual machine");
        let mut machine = MachineConfig::new(loader, self.config.cpus, self.config.memory);

        self.attach_console(&mut machine)
            .map_err(|e| e.within("attach console"))?;
        self.attach_disks(dir, &mut machine)
            .map_err(|e| e.within("attach disks"))?;

        machine.network_devices = vec![network_device()];
        debug!("attached network device");
        machine.entropy_devices = vec![entropy_device()];
        debug!("attached entropy device");

        self.attach_shared_dirs(dir, &mut machine)
            .map_err(|e| e.within("attach shared directories"))?;
        self.configure_platform(&store, &mut machine)
            .map_err(|e| e.within("configure platform"))?;

        match self.engine.validate(&machine) {
            Ok(true) => {}
            Ok(false) => return Err(VmError::InvalidConfiguration),
            Err(e) => return Err(VmError::engine("invalid configuration", e)),
        }

        let instance = self
            .engine
            .instantiate(&machine)
            .map_err(|e| VmError::engine("create virtual machine", e))?;
        debug!("starting virtual machine");
        instance
            .start()
            .map_err(|e| VmError::engine("start virtual machine", e))?;

        info!(
            data_dir = %dir.root().display(),
            cpus = machine.cpu_count,
            memory = machine.memory_size,
            install = self.config.install,
            "virtual machine started"
        );
        self.machine_config = Some(machine);
        self.instance = Some(Arc::new(instance));
        Ok(())
    }

    fn configure_cpus(&mut self, store: &StateStore) -> Result<(), VmError> {
        let bounds = self.engine.cpu_bounds();
        let cpus = negotiate(self.config.cpus, store.cpus(), DEFAULT_CPUS, bounds);
        if cpus.persist {
            store
                .save_cpus(cpus.value)
                .map_err(|e| VmError::state_io("save cpu count", e))?;
        }
        debug!(requested = self.config.cpus, cpus = cpus.value, min = bounds.min, max = bounds.max, "negotiated cpus");
        self.config.cpus = cpus.value;
        Ok(())
    }

    fn configure_memory(&mut self, store: &StateStore) -> Result<(), VmError> {
        let bounds = self.engine.memory_bounds();
        let memory = negotiate(self.config.memory, store.memory(), DEFAULT_MEMORY, bounds);
        if memory.persist {
            store
                .save_memory(memory.value)
                .map_err(|e| VmError::state_io("save memory size", e))?;
        }
        debug!(requested = self.config.memory, memory = memory.value, min = bounds.min, max = bounds.max, "negotiated memory");
        self.config.memory = memory.value;
        Ok(())
    }

    fn attach_console(&mut self, machine: &mut MachineConfig) -> Result<(), VmError> {
        let raw = RawMode::enable().map_err(|e| VmError::configuration("put stdin in raw mode", e))?;
        self.raw_mode = Some(raw);
        machine.serial_ports = vec![console_device()];
        debug!("attached console device");
        Ok(())
    }

    fn attach_disks(&mut self, dir: &DataDir, machine: &mut MachineConfig) -> Result<(), VmError> {
        if self.config.disk_size == 0 {
            self.config.disk_size = DEFAULT_DISK_SIZE;
        }
        let installer = if self.config.install {
            match self.config.installer_image.as_deref() {
                Some(image) => Some(image),
                None => {
                    return Err(VmError::configuration(
                        "create installer disk",
                        "install mode requires an installer image",
                    ));
                }
            }
        } else {
            None
        };

        let disks = storage_devices(dir, self.config.disk_size, installer)
            .map_err(|e| VmError::state_io("create disks", e))?;
        debug!(count = disks.len(), "attached disks");
        machine.storage_devices = disks;
        Ok(())
    }

    fn attach_shared_dirs(&self, dir: &DataDir, machine: &mut MachineConfig) -> Result<(), VmError> {
        let implicit = if self.config.install {
            install_shares(dir, &self.config.nix_system())
                .map_err(|e| VmError::state_io("create install shares", e))?
                .to_vec()
        } else {
            Vec::new()
        };
        machine.directory_shares = directory_shares(&implicit, &self.config.shared_directories);
        debug!(count = machine.directory_shares.len(), "attached shared directories");
        Ok(())
    }

    fn configure_platform(&mut self, store: &StateStore, machine: &mut MachineConfig) -> Result<(), VmError> {
        let engine = &self.engine;
        let (platform, source) = devices::platform(
            store,
            || engine.new_machine_identifier(),
            |bytes| engine.machine_identifier_from_bytes(bytes),
        )
        .map_err(|e| match e {
            IdentityError::Save(source) => VmError::state_io("save machine identifier", source),
            IdentityError::Generate(source) => VmError::engine("create machine identifier", source),
            IdentityError::Load(source) => VmError::engine("load machine identifier", source),
        })?;

        debug!(?source, "configured platform identity");
        self.machine_id = Some(platform.machine_identifier.clone());
        machine.platform = Some(platform);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Ask the guest to shut down, waiting until it has or until `cancel`
    /// completes, whichever is first.
    ///
    /// A no-op when the VM is not running. If the engine rejects the request
    /// or fails, the VM is stopped forcibly and the original error returned.
    /// If `cancel` wins, [`VmError::Cancelled`] is returned and the stop task
    /// is kept; a later `stop` or [`Vm::reap_pending_stop`] picks it up.
    pub async fn stop<C>(&mut self, cancel: C) -> Result<(), VmError>
    where
        C: Future<Output = ()>,
    {
        let Some(instance) = self.instance.clone() else {
            return Ok(());
        };

        let mut task = match self.pending_stop.take() {
            Some(task) => task,
            None => {
                let dispatch = self.dispatch();
                tokio::task::spawn_blocking(move || {
                    tracing::dispatcher::with_default(&dispatch, || graceful_stop(instance.as_ref()))
                })
            }
        };

        tokio::pin!(cancel);
        let joined = tokio::select! {
            biased;
            () = &mut cancel => None,
            joined = &mut task => Some(joined),
        };

        let Some(joined) = joined else {
            self.in_log_scope(|| warn!("stop cancelled, graceful shutdown still in flight"));
            self.pending_stop = Some(task);
            return Err(VmError::Cancelled);
        };

        let outcome = flatten_join(joined);
        self.finish_stop(&outcome);
        outcome
    }

    /// Wait for a stop task orphaned by a cancelled [`Vm::stop`].
    ///
    /// Returns `None` when there is nothing to reap.
    pub async fn reap_pending_stop(&mut self) -> Option<Result<(), VmError>> {
        let task = self.pending_stop.take()?;
        let outcome = flatten_join(task.await);
        self.finish_stop(&outcome);
        Some(outcome)
    }

    fn finish_stop(&mut self, outcome: &Result<(), VmError>) {
        self.instance = None;
        self.state = VmState::Stopped;
        if let Some(mut raw) = self.raw_mode.take() {
            raw.restore();
        }

        let cleanup = match self.data_dir.as_mut() {
            Some(dir) => dir.cleanup(),
            None => Ok(()),
        };

        self.in_log_scope(|| {
            match outcome {
                Ok(()) => info!("virtual machine stopped"),
                Err(e) => warn!(error = %e, "virtual machine stopped after failed graceful shutdown"),
            }
            if let Err(e) = &cleanup {
                warn!(error = %e, "could not remove temporary data directory");
            }
        });
    }

    fn dispatch(&self) -> Dispatch {
        match &self.log {
            Some(log) => log.dispatch().clone(),
            None => tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    fn in_log_scope(&self, f: impl FnOnce()) {
        match &self.log {
            Some(log) => log.in_scope(f),
            None => f(),
        }
    }
}

impl<E: Engine> std::fmt::Debug for Vm<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("data_dir", &self.data_dir())
            .field("running", &self.is_running())
            .field("pending_stop", &self.has_pending_stop())
            .finish()
    }
}

/// Runs on a blocking worker: request a graceful stop, forcing one if the
/// engine refuses or errors.
fn graceful_stop<I: Instance>(instance: &I) -> Result<(), VmError> {
    match instance.request_stop() {
        Ok(true) => {
            debug!("graceful stop requested");
            Ok(())
        }
        Ok(false) => {
            force_stop(instance);
            Err(VmError::engine(
                "stop virtual machine",
                EngineError::new("invalid machine state for stopping"),
            ))
        }
        Err(e) => {
            force_stop(instance);
            Err(VmError::engine("could not shut down gracefully", e))
        }
    }
}

/// A failed forced stop is logged only; the caller sees the graceful-stop
/// error.
fn force_stop<I: Instance>(instance: &I) {
    match instance.stop() {
        Ok(()) => debug!("forced stop"),
        Err(e) => warn!(error = %e, "forced stop failed"),
    }
}

fn flatten_join(joined: Result<Result<(), VmError>, tokio::task::JoinError>) -> Result<(), VmError> {
    joined.unwrap_or_else(|e| {
        Err(VmError::engine(
            "stop virtual machine",
            EngineError::with_source("stop task failed", e),
        ))
    })
}
