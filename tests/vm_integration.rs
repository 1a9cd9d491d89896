//! End-to-end tests that boot a real guest through vfkit.
//!
//! They need macOS, a `vfkit` binary and a bundle holding an installed guest
//! (`boot/default/init`, `boot/nixos-kernel`, `boot/nixos-initrd`,
//! `disk.img`), so they are gated with the `vm-integration-tests` feature.
//!
//! # Running
//!
//! ```bash
//! SANDBOX_VM_TEST_BUNDLE=~/.local/share/sandbox-vm/test \
//!     cargo test --features vm-integration-tests --test vm_integration
//! ```

#![cfg(all(feature = "vm-integration-tests", target_os = "macos"))]

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sandbox_vm::vm::{VfkitEngine, Vm, VmConfig, VmState};

// ---------------------------------------------------------------------------
// Environment variable helpers
// ---------------------------------------------------------------------------

/// Bundle with an installed guest. Copied per test so runs don't share state.
fn test_bundle() -> PathBuf {
    std::env::var("SANDBOX_VM_TEST_BUNDLE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("fixtures")
                .join("bundle")
        })
}

/// Port for the vfkit REST management API used by the test VM.
fn test_rest_port() -> u16 {
    std::env::var("SANDBOX_VM_TEST_REST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7799)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn copy_bundle(into: &std::path::Path) -> Result<()> {
    let src = test_bundle();
    if !src.join("boot").join("default").join("init").exists() {
        bail!("no installed guest in {}", src.display());
    }
    let status = std::process::Command::new("cp")
        .arg("-Rc")
        .arg(format!("{}/.", src.display()))
        .arg(into)
        .status()
        .context("copy test bundle")?;
    if !status.success() {
        bail!("cp exited with {status}");
    }
    Ok(())
}

fn engine() -> Result<VfkitEngine> {
    Ok(VfkitEngine::new()?.rest_port(test_rest_port()))
}

/// Wait for vfkit's REST endpoint so a stop request has somewhere to go.
async fn wait_for_rest(deadline: Duration) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], test_rest_port()));
    let start = tokio::time::Instant::now();
    loop {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
            return Ok(());
        }
        if start.elapsed() > deadline {
            bail!("vfkit REST endpoint not reachable on {addr}");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn config(dir: &std::path::Path) -> VmConfig {
    VmConfig {
        host_data_dir: Some(dir.to_path_buf()),
        ..VmConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn boots_and_stops_gracefully() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    copy_bundle(tmp.path())?;

    let mut vm = Vm::new(engine()?, config(tmp.path()));
    vm.start()?;
    assert_eq!(vm.state(), VmState::Running);
    wait_for_rest(Duration::from_secs(30)).await?;

    vm.stop(tokio::time::sleep(Duration::from_secs(60))).await?;
    assert_eq!(vm.state(), VmState::Stopped);

    let log = std::fs::read_to_string(tmp.path().join("log"))?;
    assert!(log.contains("virtual machine stopped"), "{log}");
    Ok(())
}

#[tokio::test]
async fn restart_keeps_machine_identity() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    copy_bundle(tmp.path())?;

    let mut vm = Vm::new(engine()?, config(tmp.path()));
    vm.start()?;
    let first = vm.machine_id().cloned().context("no machine id")?;
    let cpus = vm.config().cpus;
    wait_for_rest(Duration::from_secs(30)).await?;
    vm.stop(tokio::time::sleep(Duration::from_secs(60))).await?;
    drop(vm);

    let mut vm = Vm::new(engine()?, config(tmp.path()));
    vm.start()?;
    assert_eq!(vm.machine_id(), Some(&first));
    assert_eq!(vm.config().cpus, cpus);
    wait_for_rest(Duration::from_secs(30)).await?;
    vm.stop(tokio::time::sleep(Duration::from_secs(60))).await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_stop_can_be_reaped() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    copy_bundle(tmp.path())?;

    let mut vm = Vm::new(engine()?, config(tmp.path()));
    vm.start()?;
    wait_for_rest(Duration::from_secs(30)).await?;

    let err = vm.stop(std::future::ready(())).await.unwrap_err();
    assert!(err.is_cancelled());

    let outcome = tokio::time::timeout(Duration::from_secs(60), vm.reap_pending_stop())
        .await
        .context("stop did not finish")?
        .context("no pending stop")?;
    outcome?;
    assert_eq!(vm.state(), VmState::Stopped);
    Ok(())
}
