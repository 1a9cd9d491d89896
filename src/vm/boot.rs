//! Boot loader selection: direct kernel boot for an installed guest, EFI
//! firmware for the installer.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::vm::data_dir::{DataDir, create_exclusive, ensure_parent};
use crate::vm::engine::BootLoader;

/// Kernel flags appended after `init=`.
const QUIET_BOOT_FLAGS: &str = "quiet boot.shell_on_fail rd.systemd.show_status=false \
                                rd.udev.log_level=3 rd.udev.log_priority=3";

/// Kernel command line for a normal boot of the installed guest.
pub fn kernel_command_line(guest_init: &Path) -> String {
    format!(
        "console=hvc0 root=/dev/vda init={} {QUIET_BOOT_FLAGS}",
        guest_init.display()
    )
}

/// Direct kernel boot from the artifacts the installer left in the bundle.
///
/// `boot/default/init` is a symlink whose target is the init path *inside*
/// the guest. A missing link means the guest was never installed.
pub fn linux_boot_loader(dir: &DataDir) -> io::Result<BootLoader> {
    let init_link = dir.init();
    let guest_init = std::fs::read_link(&init_link).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!(
                "determine path to kernel init file inside vm ({}): {e}",
                init_link.display()
            ),
        )
    })?;

    let command_line = kernel_command_line(&guest_init);
    debug!(params = %command_line, "created linux boot loader");
    Ok(BootLoader::Linux {
        kernel: dir.kernel(),
        initrd: dir.initrd(),
        command_line,
    })
}

/// Firmware boot backed by the bundle's NVRAM store.
pub fn efi_boot_loader(dir: &DataDir) -> io::Result<BootLoader> {
    let nvram = dir.nvram();
    let created = create_exclusive(&nvram)?.is_some();
    debug!(path = %nvram.display(), created, "created efi boot loader");
    Ok(BootLoader::Efi {
        variable_store: nvram,
        create_variable_store: created,
    })
}

/// Shell script run by the installer guest. `system` is a Nix system string
/// such as `aarch64-linux`.
pub fn bootstrap_script(system: &str) -> String {
    format!(
        r#"#!/bin/sh
# Generated by sandbox-vm. Installs NixOS onto /dev/vda and copies the boot
# artifacts back to the host through the "boot" share.
set -eu

SYSTEM="{system}"
HOST_BOOT=/mnt/host-boot

parted -s /dev/vda -- mklabel gpt
parted -s /dev/vda -- mkpart root ext4 1MiB 100%
mkfs.ext4 -F -L nixos /dev/vda1
mount /dev/disk/by-label/nixos /mnt

mkdir -p "$HOST_BOOT"
mount -t virtiofs boot "$HOST_BOOT"

nixos-generate-config --root /mnt
nixos-install --root /mnt --no-root-passwd --system "$SYSTEM"

toplevel=$(readlink -f /mnt/nix/var/nix/profiles/system)
cp -L "$toplevel/kernel" "$HOST_BOOT/nixos-kernel"
cp -L "$toplevel/initrd" "$HOST_BOOT/nixos-initrd"
mkdir -p "$HOST_BOOT/default"
ln -sfn "$toplevel/init" "$HOST_BOOT/default/init"

sync
poweroff
"#
    )
}

/// Write the bootstrap script into the bundle and return the directory that
/// contains it, ready to be shared with the guest.
pub fn write_bootstrap_script(dir: &DataDir, system: &str) -> io::Result<PathBuf> {
    let path = dir.bootstrap_script();
    ensure_parent(&path)?;

    let mut f = std::fs::File::create(&path)?;
    f.write_all(bootstrap_script(system).as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        f.set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }
    debug!(path = %path.display(), system, "wrote bootstrap script");

    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("bootstrap script has no parent directory"))
}
