//! sandbox-vm: boot a development VM with its console on this terminal.
//!
//! Configuration comes from an optional TOML file (`--config`) with command
//! line flags taking precedence. Ctrl-C requests a graceful shutdown.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use sandbox_vm::logging;
use sandbox_vm::vm::{SharedDirectory, VfkitEngine, Vm, VmConfig};

/// Run a sandbox VM
#[derive(Parser, Debug)]
#[command(name = "sandbox-vm", version, about = "Run a sandbox virtual machine")]
struct Args {
    /// TOML file with VM settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the VM's disk and state (temporary if omitted)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Number of vCPUs (0 = reuse previous run or default)
    #[arg(long)]
    cpus: Option<u32>,

    /// Guest memory in MiB (0 = reuse previous run or default)
    #[arg(long)]
    memory_mib: Option<u64>,

    /// Root disk size in GiB for a new VM
    #[arg(long)]
    disk_gib: Option<u64>,

    /// Boot the installer ISO instead of the installed system
    #[arg(long)]
    install: bool,

    /// Installer ISO used with --install
    #[arg(long)]
    installer_image: Option<PathBuf>,

    /// Share a host directory; append `:ro` for read-only
    #[arg(short, long = "share")]
    shares: Vec<String>,

    /// Port for the vfkit REST management API
    #[arg(long, default_value_t = 7788)]
    rest_port: u16,

    /// Seconds to wait for a graceful shutdown after Ctrl-C
    #[arg(long, default_value_t = 30)]
    stop_timeout: u64,
}

impl Args {
    fn vm_config(&self) -> Result<VmConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                toml::from_str::<VmConfig>(&text)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
            None => VmConfig::default(),
        };

        if let Some(dir) = &self.data_dir {
            config.host_data_dir = Some(dir.clone());
        }
        if let Some(cpus) = self.cpus {
            config.cpus = cpus;
        }
        if let Some(mib) = self.memory_mib {
            config.memory = mib << 20;
        }
        if let Some(gib) = self.disk_gib {
            config.disk_size = gib << 30;
        }
        if self.install {
            config.install = true;
        }
        if let Some(image) = &self.installer_image {
            config.installer_image = Some(image.clone());
        }
        config
            .shared_directories
            .extend(self.shares.iter().map(|s| parse_share(s)));
        Ok(config)
    }
}

fn parse_share(arg: &str) -> SharedDirectory {
    match arg.strip_suffix(":ro") {
        Some(path) => SharedDirectory::new(path, true),
        None => SharedDirectory::new(arg, false),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init();
    let args = Args::parse();

    let config = args.vm_config()?;
    let engine = VfkitEngine::new()
        .context("locate vfkit")?
        .rest_port(args.rest_port);

    let mut vm = Vm::new(engine, config);
    vm.start().context("start virtual machine")?;
    info!(data_dir = ?vm.data_dir(), "virtual machine running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;

    let timeout = Duration::from_secs(args.stop_timeout);
    match vm.stop(tokio::time::sleep(timeout)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            warn!(timeout_secs = args.stop_timeout, "guest did not stop in time");
            Err(e).context("stop virtual machine")
        }
        Err(e) => Err(e).context("stop virtual machine"),
    }
}
