//! [`Engine`] backed by `vfkit`, the command-line front end to macOS
//! Virtualization.framework.
//!
//! ```text
//! VfkitEngine::instantiate(MachineConfig)
//!     └─► VfkitMachine { argv }
//!             ├─► start()         spawn vfkit (console on our stdio)
//!             ├─► request_stop()  PUT /vm/state {"state":"Stop"}
//!             └─► stop()          kill the vfkit process
//! ```
//!
//! ## External Requirements
//!
//! - `vfkit` on `$PATH` or in a Homebrew prefix.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::vm::engine::{
    BootLoader, DirectoryShare, Engine, EngineError, Instance, MachineConfig, NetworkAttachment,
    SerialPort, StorageDevice,
};
use crate::vm::resources::Bounds;

const MIB: u64 = 1 << 20;

/// Smallest guest memory Virtualization.framework accepts.
const MIN_MEMORY: u64 = 128 * MIB;

/// Used when the host's physical memory cannot be queried.
const FALLBACK_MAX_MEMORY: u64 = 8 << 30;

const DEFAULT_REST_PORT: u16 = 7788;

const STOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct VfkitEngine {
    binary: PathBuf,
    rest_port: u16,
    cpu_bounds: Bounds<u32>,
    memory_bounds: Bounds<u64>,
}

impl VfkitEngine {
    /// Locate `vfkit` and probe host limits.
    pub fn new() -> Result<Self, EngineError> {
        let binary = find_vfkit()?;
        info!(path = %binary.display(), "found vfkit binary");
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        let max_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let max_memory = host_memory().unwrap_or_else(|| {
            warn!("could not query host memory, assuming {FALLBACK_MAX_MEMORY} bytes");
            FALLBACK_MAX_MEMORY
        });
        Self {
            binary: binary.into(),
            rest_port: DEFAULT_REST_PORT,
            cpu_bounds: Bounds::new(1, max_cpus.max(1)),
            memory_bounds: Bounds::new(MIN_MEMORY, max_memory.max(MIN_MEMORY)),
        }
    }

    /// Port for the vfkit REST management API.
    pub fn rest_port(mut self, port: u16) -> Self {
        self.rest_port = port;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Engine for VfkitEngine {
    type Instance = VfkitMachine;

    fn cpu_bounds(&self) -> Bounds<u32> {
        self.cpu_bounds
    }

    fn memory_bounds(&self) -> Bounds<u64> {
        self.memory_bounds
    }

    fn validate(&self, config: &MachineConfig) -> Result<bool, EngineError> {
        if !self.binary.exists() {
            return Err(EngineError::new(format!(
                "vfkit binary not found at {}",
                self.binary.display()
            )));
        }
        match validation_problem(config, self.cpu_bounds, self.memory_bounds) {
            Some(problem) => {
                warn!(%problem, "vfkit configuration rejected");
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn instantiate(&self, config: &MachineConfig) -> Result<VfkitMachine, EngineError> {
        if config.platform.is_some() {
            debug!("vfkit assigns its own machine identifier; persisted identity is not forwarded");
        }
        Ok(VfkitMachine {
            binary: self.binary.clone(),
            args: build_vfkit_args(config, self.rest_port),
            rest_port: self.rest_port,
            child: Mutex::new(None),
        })
    }
}

/// A vfkit process for one machine.
#[derive(Debug)]
pub struct VfkitMachine {
    binary: PathBuf,
    args: Vec<String>,
    rest_port: u16,
    child: Mutex<Option<Child>>,
}

impl VfkitMachine {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn state_url(&self) -> String {
        format!("http://localhost:{}/vm/state", self.rest_port)
    }
}

impl Instance for VfkitMachine {
    fn start(&self) -> Result<(), EngineError> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| EngineError::new("vfkit process lock poisoned"))?;
        if guard.is_some() {
            return Err(EngineError::new("vfkit is already running"));
        }

        // The guest console is attached to our stdio.
        let child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::with_source("spawn vfkit process", e))?;

        info!(pid = child.id(), port = self.rest_port, "vfkit spawned");
        *guard = Some(child);
        Ok(())
    }

    fn request_stop(&self) -> Result<bool, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(STOP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::with_source("build http client", e))?;

        let resp = client
            .put(self.state_url())
            .json(&serde_json::json!({"state": "Stop"}))
            .send()
            .map_err(|e| EngineError::with_source("send vfkit stop request", e))?;

        let status = resp.status();
        info!(port = self.rest_port, status = status.as_u16(), "VM stop request sent");
        Ok(status.is_success())
    }

    fn stop(&self) -> Result<(), EngineError> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| EngineError::new("vfkit process lock poisoned"))?;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                info!(exit_status = ?status, "vfkit already exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not poll vfkit process"),
        }

        child
            .kill()
            .map_err(|e| EngineError::with_source("kill vfkit process", e))?;
        let status = child
            .wait()
            .map_err(|e| EngineError::with_source("wait for vfkit process", e))?;
        info!(exit_status = ?status, "vfkit killed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Argument construction
// ---------------------------------------------------------------------------

/// Full vfkit argument vector for `config`.
pub fn build_vfkit_args(config: &MachineConfig, rest_port: u16) -> Vec<String> {
    let mut args = vec![
        "--cpus".to_string(),
        config.cpu_count.to_string(),
        "--memory".to_string(),
        (config.memory_size / MIB).to_string(),
        "--bootloader".to_string(),
        bootloader_spec(&config.boot_loader),
    ];

    for port in &config.serial_ports {
        match port {
            SerialPort::Stdio => push_device(&mut args, "virtio-serial,stdio".to_string()),
        }
    }
    for net in &config.network_devices {
        match net.attachment {
            NetworkAttachment::Nat => push_device(&mut args, format!("virtio-net,nat,mac={}", net.mac)),
        }
    }
    for _ in &config.entropy_devices {
        push_device(&mut args, "virtio-rng".to_string());
    }
    for disk in &config.storage_devices {
        push_device(&mut args, storage_spec(disk));
    }
    for share in &config.directory_shares {
        args.extend(build_vfkit_virtiofs_args(share));
    }

    args.push("--restful-uri".to_string());
    args.push(format!("tcp://localhost:{rest_port}"));
    args
}

fn push_device(args: &mut Vec<String>, spec: String) {
    args.push("--device".to_string());
    args.push(spec);
}

fn bootloader_spec(loader: &BootLoader) -> String {
    match loader {
        BootLoader::Linux {
            kernel,
            initrd,
            command_line,
        } => format!(
            "linux,kernel={},initrd={},cmdline=\"{}\"",
            kernel.display(),
            initrd.display(),
            command_line
        ),
        BootLoader::Efi {
            variable_store,
            create_variable_store,
        } => {
            let mut spec = format!("efi,variable-store={}", variable_store.display());
            if *create_variable_store {
                spec.push_str(",create");
            }
            spec
        }
    }
}

fn storage_spec(disk: &StorageDevice) -> String {
    let mut spec = format!("virtio-blk,path={}", disk.path.display());
    if disk.read_only {
        spec.push_str(",readonly");
    }
    spec
}

/// Generate the `--device virtio-fs,...` command-line arguments for vfkit.
///
/// ```text
/// --device virtio-fs,sharedDir=<host_path>,mountTag=<tag>
/// ```
///
/// vfkit has no read-only option for virtio-fs, so `read_only` cannot be
/// expressed here. [`VfkitEngine::validate`] refuses such shares instead.
pub fn build_vfkit_virtiofs_args(share: &DirectoryShare) -> Vec<String> {
    let device_spec = format!(
        "virtio-fs,sharedDir={},mountTag={}",
        share.path.display(),
        share.tag,
    );
    vec!["--device".to_string(), device_spec]
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validation_problem(
    config: &MachineConfig,
    cpus: Bounds<u32>,
    memory: Bounds<u64>,
) -> Option<String> {
    if cpus.clamp(config.cpu_count) != config.cpu_count {
        return Some(format!(
            "cpu count {} outside [{}, {}]",
            config.cpu_count, cpus.min, cpus.max
        ));
    }
    if memory.clamp(config.memory_size) != config.memory_size {
        return Some(format!(
            "memory size {} outside [{}, {}]",
            config.memory_size, memory.min, memory.max
        ));
    }
    // `--memory` is given in MiB.
    if config.memory_size % MIB != 0 {
        return Some(format!(
            "memory size {} is not a whole number of MiB",
            config.memory_size
        ));
    }

    match &config.boot_loader {
        BootLoader::Linux { kernel, initrd, .. } => {
            for path in [kernel, initrd] {
                if !path.is_file() {
                    return Some(format!("boot file missing: {}", path.display()));
                }
            }
        }
        BootLoader::Efi { variable_store, .. } => {
            if !variable_store.is_file() {
                return Some(format!("variable store missing: {}", variable_store.display()));
            }
        }
    }

    if config.storage_devices.is_empty() {
        return Some("no storage devices".to_string());
    }
    if let Some(disk) = config.storage_devices.iter().find(|d| !d.path.is_file()) {
        return Some(format!("disk image missing: {}", disk.path.display()));
    }
    if let Some(share) = config.directory_shares.iter().find(|s| s.read_only) {
        return Some(format!(
            "read-only shared directory {} cannot be expressed with vfkit virtio-fs",
            share.path.display()
        ));
    }
    if let Some(share) = config.directory_shares.iter().find(|s| !s.path.is_dir()) {
        return Some(format!("shared directory missing: {}", share.path.display()));
    }
    None
}

// ---------------------------------------------------------------------------
// Host discovery
// ---------------------------------------------------------------------------

/// Resolve the path to the `vfkit` binary, returning an error if it is not
/// found in any standard location.
fn find_vfkit() -> Result<PathBuf, EngineError> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("vfkit");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    // Homebrew on Intel and Apple Silicon.
    let candidates: &[&str] = &["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"];
    for &path in candidates {
        if PathBuf::from(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(EngineError::new(
        "vfkit binary not found. Install it with: brew install vfkit\n\
         Or set PATH to include the directory containing vfkit.",
    ))
}

#[cfg(target_os = "macos")]
fn host_memory() -> Option<u64> {
    let output = Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(not(target_os = "macos"))]
fn host_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::engine::{EntropyDevice, MacAddress, NetworkDevice};

    fn linux_config() -> MachineConfig {
        let mut config = MachineConfig::new(
            BootLoader::Linux {
                kernel: PathBuf::from("/vm/boot/nixos-kernel"),
                initrd: PathBuf::from("/vm/boot/nixos-initrd"),
                command_line: "console=hvc0 root=/dev/vda".to_string(),
            },
            2,
            1 << 30,
        );
        config.serial_ports = vec![SerialPort::Stdio];
        config.network_devices = vec![NetworkDevice {
            attachment: NetworkAttachment::Nat,
            mac: MacAddress::new([0x02, 0, 0, 0, 0, 1]),
        }];
        config.entropy_devices = vec![EntropyDevice];
        config.storage_devices = vec![StorageDevice {
            path: PathBuf::from("/vm/disk.img"),
            read_only: false,
        }];
        config.directory_shares = vec![DirectoryShare {
            tag: "src".to_string(),
            path: PathBuf::from("/Users/me/src"),
            read_only: true,
        }];
        config
    }

    #[test]
    fn virtiofs_args_format() {
        let share = DirectoryShare {
            tag: "sandbox-drop".to_string(),
            path: PathBuf::from("/Users/me/sandbox-drop"),
            read_only: false,
        };
        assert_eq!(
            build_vfkit_virtiofs_args(&share),
            vec![
                "--device".to_string(),
                "virtio-fs,sharedDir=/Users/me/sandbox-drop,mountTag=sandbox-drop".to_string(),
            ]
        );
    }

    #[test]
    fn args_cover_every_device() {
        let args = build_vfkit_args(&linux_config(), 7799);
        let joined = args.join(" ");

        assert_eq!(&args[..4], &["--cpus", "2", "--memory", "1024"]);
        assert!(joined.contains(
            "--bootloader linux,kernel=/vm/boot/nixos-kernel,initrd=/vm/boot/nixos-initrd,cmdline=\"console=hvc0 root=/dev/vda\""
        ));
        assert!(joined.contains("--device virtio-serial,stdio"));
        assert!(joined.contains("--device virtio-net,nat,mac=02:00:00:00:00:01"));
        assert!(joined.contains("--device virtio-rng"));
        assert!(joined.contains("--device virtio-blk,path=/vm/disk.img"));
        assert!(joined.contains("--device virtio-fs,sharedDir=/Users/me/src,mountTag=src"));
        assert!(joined.ends_with("--restful-uri tcp://localhost:7799"));
    }

    #[test]
    fn efi_loader_and_readonly_disk() {
        let mut config = linux_config();
        config.boot_loader = BootLoader::Efi {
            variable_store: PathBuf::from("/vm/nvram"),
            create_variable_store: true,
        };
        config.storage_devices.push(StorageDevice {
            path: PathBuf::from("/isos/nixos.iso"),
            read_only: true,
        });

        let joined = build_vfkit_args(&config, 7799).join(" ");
        assert!(joined.contains("--bootloader efi,variable-store=/vm/nvram,create"));
        assert!(joined.contains("--device virtio-blk,path=/isos/nixos.iso,readonly"));
    }

    #[test]
    fn validation_rejects_out_of_range_cpus() {
        let mut config = linux_config();
        config.cpu_count = 64;
        let problem = validation_problem(&config, Bounds::new(1, 8), Bounds::new(MIN_MEMORY, 8 << 30));
        assert!(problem.unwrap().contains("cpu count"));
    }

    #[test]
    fn validation_rejects_missing_boot_files() {
        let problem = validation_problem(&linux_config(), Bounds::new(1, 8), Bounds::new(MIN_MEMORY, 8 << 30));
        assert!(problem.unwrap().contains("boot file missing"));
    }

    /// A bundle that passes validation, rooted in `tmp`.
    fn valid_config(tmp: &Path) -> MachineConfig {
        let kernel = tmp.join("kernel");
        let initrd = tmp.join("initrd");
        let disk = tmp.join("disk.img");
        for p in [&kernel, &initrd, &disk] {
            std::fs::write(p, b"").unwrap();
        }

        let mut config = linux_config();
        config.boot_loader = BootLoader::Linux {
            kernel,
            initrd,
            command_line: String::new(),
        };
        config.storage_devices = vec![StorageDevice {
            path: disk,
            read_only: false,
        }];
        config.directory_shares = vec![DirectoryShare {
            tag: "share".to_string(),
            path: tmp.to_path_buf(),
            read_only: false,
        }];
        config
    }

    #[test]
    fn validation_refuses_read_only_share() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = valid_config(tmp.path());
        config.directory_shares[0].read_only = true;

        let problem = validation_problem(&config, Bounds::new(1, 8), Bounds::new(MIN_MEMORY, 8 << 30));
        assert!(problem.unwrap().contains("read-only shared directory"));

        let engine = VfkitEngine::with_binary(tmp.path().join("kernel"));
        assert!(!engine.validate(&config).unwrap());
    }

    #[test]
    fn validation_refuses_memory_that_is_not_whole_mib() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = valid_config(tmp.path());
        config.memory_size = (1 << 30) + 4096;

        let problem = validation_problem(&config, Bounds::new(1, 8), Bounds::new(MIN_MEMORY, 8 << 30));
        assert!(problem.unwrap().contains("whole number of MiB"));
    }

    #[test]
    fn validation_accepts_complete_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let config = valid_config(tmp.path());
        assert_eq!(
            validation_problem(&config, Bounds::new(1, 8), Bounds::new(MIN_MEMORY, 8 << 30)),
            None
        );
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let engine = VfkitEngine::with_binary("/nonexistent/vfkit");
        let machine = engine.instantiate(&linux_config()).unwrap();
        assert!(machine.stop().is_ok());
    }

    #[test]
    fn host_bounds_are_sane() {
        let engine = VfkitEngine::with_binary("/nonexistent/vfkit");
        assert!(engine.cpu_bounds().min >= 1);
        assert!(engine.cpu_bounds().max >= engine.cpu_bounds().min);
        assert!(engine.memory_bounds().max >= MIN_MEMORY);
    }
}
