//! Catalog builder: enumerates candidate partitions, reads the boot
//! configuration partition and merges both into a boot item registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::catalog::{BootConfig, BootItem, BootType, Device, DeviceType, Icon};
use crate::config::{self, BootEntry, Settings};
use crate::sys::SysOps;

/// Kernel images tried, in order, when a boot entry names no kernel.
/// The machine-specific kernel is checked before these.
const DEFAULT_KERNELS: [&str; 2] = ["/boot/zImage", "/zImage"];

/// Producer of fresh boot item registries. The UI state machine holds
/// one for the Rescan action.
pub trait Scanner {
    fn scan(&mut self) -> Result<BootConfig>;
}

/// Low-level partition enumerator boundary. Yields devices already
/// filtered by the acceptable filesystem type set; `None` means no more
/// devices.
pub trait DeviceEnumerator {
    fn next_device(&mut self) -> Option<Device>;
}

/// Enumerator over the block devices `lsblk` reports.
pub struct BlockDeviceEnumerator {
    devices: std::vec::IntoIter<Device>,
}

impl BlockDeviceEnumerator {
    pub fn open(accept_fstypes: &[String]) -> Result<Self> {
        let output = Command::new("lsblk")
            .args(["-b", "-l", "-n", "-o", "NAME,FSTYPE,SIZE"])
            .output()
            .context("Failed to run lsblk")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self { devices: parse_lsblk(&stdout, accept_fstypes).into_iter() })
    }
}

impl DeviceEnumerator for BlockDeviceEnumerator {
    fn next_device(&mut self) -> Option<Device> {
        self.devices.next()
    }
}

/// Parse `lsblk -b -l -n -o NAME,FSTYPE,SIZE` output. Devices without a
/// recognized filesystem are dropped, as are loop, ram and optical
/// devices.
fn parse_lsblk(table: &str, accept_fstypes: &[String]) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in table.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        // A missing FSTYPE collapses the row to two columns.
        if parts.len() != 3 {
            continue;
        }

        let (name, fstype, size) = (parts[0], parts[1], parts[2]);
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("sr") {
            continue;
        }
        if !accept_fstypes.iter().any(|t| t == fstype) {
            continue;
        }

        let size_bytes: u64 = size.parse().unwrap_or(0);
        devices.push(Device {
            path: format!("/dev/{}", name),
            fstype: fstype.to_string(),
            blocks: size_bytes / 1024,
        });
    }

    devices
}

/// Machine-specific kernel path derived from the `Hardware` line of
/// /proc/cpuinfo, if the platform exposes one.
pub fn machine_kernel_path() -> Option<PathBuf> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
    let hardware = cpuinfo
        .lines()
        .find(|line| line.starts_with("Hardware"))
        .and_then(|line| line.split(':').nth(1))?;
    Some(machine_kernel_from_hardware(hardware))
}

/// `"Sharp Zaurus SL-C1000"` -> `/boot/zImage-sharp_zaurus_sl-c1000`
pub fn machine_kernel_from_hardware(hardware: &str) -> PathBuf {
    let name: String = hardware
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c.to_ascii_lowercase() })
        .collect();
    PathBuf::from(format!("/boot/zImage-{}", name))
}

/// Builds the boot item registry from one scan pass. Owns its own
/// syscall handle so UI-driven rescans stay independent of the boot
/// executor's.
pub struct CatalogBuilder<S> {
    settings: Settings,
    sys: S,
    machine_kernel: Option<PathBuf>,
}

impl<S: SysOps> CatalogBuilder<S> {
    pub fn new(settings: Settings, sys: S) -> Self {
        Self { settings, sys, machine_kernel: machine_kernel_path() }
    }

    /// Merge enumerated devices with the boot entry files found on the
    /// configuration partition. The partition is unmounted again no
    /// matter how enumeration goes; any failure yields an empty but
    /// valid registry so callers can proceed to an empty menu.
    pub fn scan_devices(&mut self, devices: Vec<Device>) -> BootConfig {
        let mut registry = BootConfig::with_capacity(4);
        registry.timeout = self.settings.timeout;

        log::info!("Scanning {} candidate partition(s)", devices.len());

        if let Err(e) = self.sys.mount(
            &self.settings.conf_device,
            &self.settings.boot_mount,
            &self.settings.conf_fstype,
            true,
        ) {
            log::warn!(
                "Can't mount boot configuration partition '{}': {:#}",
                self.settings.conf_device,
                e
            );
            return registry;
        }

        let conf_dir = self.settings.boot_mount.join(&self.settings.conf_dir);
        match fs::read_dir(&conf_dir) {
            Ok(entries) => {
                let mut files: Vec<_> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                files.sort();

                for path in files {
                    log::info!("Found boot entry file {}", path.display());
                    match config::parse_entry(&path) {
                        Ok(entry) => self.merge_entry(&mut registry, &devices, entry),
                        Err(e) => log::warn!("Skipping boot entry: {:#}", e),
                    }
                }
            }
            Err(e) => log::warn!("No boot entries in {}: {}", conf_dir.display(), e),
        }

        if let Err(e) = self.sys.unmount(&self.settings.boot_mount) {
            log::warn!("Can't unmount boot configuration partition: {:#}", e);
        }

        log::info!("Scan produced {} boot item(s)", registry.fill());
        registry
    }

    /// Merge one parsed entry with its owning device into a boot item.
    fn merge_entry(&self, registry: &mut BootConfig, devices: &[Device], entry: BootEntry) {
        let device_path = entry.device.as_deref().unwrap_or(&self.settings.conf_device);
        let Some(device) = devices.iter().find(|d| d.path == device_path) else {
            log::warn!("Boot entry names unknown device '{}', skipping", device_path);
            return;
        };

        let kernel = entry.kernel.unwrap_or_else(|| self.default_kernel());

        // The icon lives on the configuration partition, which is still
        // mounted at this point.
        let icon = entry.icon.and_then(|rel| {
            let path = self.settings.boot_mount.join(rel);
            match fs::read(&path) {
                Ok(data) => Some(Icon::new(data)),
                Err(e) => {
                    log::warn!("Can't read icon '{}': {}", path.display(), e);
                    None
                }
            }
        });

        let image_path = entry
            .image
            .as_deref()
            .map(|img| self.settings.boot_mount.join(img.trim_start_matches('/')));

        let boot_type = BootType {
            linux: entry.linux,
            image: entry.image.is_some(),
            kexec: entry.kexec,
        };

        let item = BootItem {
            device: device.path.clone(),
            fstype: device.fstype.clone(),
            blocks: device.blocks,
            label: entry.label,
            kernel,
            cmdline: entry.cmdline,
            initrd: entry.initrd,
            directory: entry.directory,
            image: entry.image,
            image_path,
            icon,
            dtype: DeviceType::from_device_path(&device.path),
            boot_type,
            priority: entry.priority,
        };

        log::info!("+ [{}]", item.display_label());
        let index = registry.push(item);

        if entry.default {
            if let Err(e) = registry.set_default(index) {
                log::warn!("Ignoring default marker: {:#}", e);
            }
        }
        if let Some(timeout) = entry.timeout {
            registry.timeout = timeout;
        }
    }

    /// Ordered default kernel lookup: the machine-specific kernel, then
    /// the well-known paths, taking the first that exists on the still
    /// mounted configuration partition. When none exists the first
    /// well-known path is used anyway; the boot attempt will report the
    /// missing kernel.
    fn default_kernel(&self) -> PathBuf {
        let defaults = DEFAULT_KERNELS.iter().map(Path::new);
        let candidates = self.machine_kernel.as_deref().into_iter().chain(defaults);

        for candidate in candidates {
            let rel = candidate.strip_prefix("/").unwrap_or(candidate);
            if self.settings.boot_mount.join(rel).is_file() {
                return candidate.to_path_buf();
            }
        }
        PathBuf::from(DEFAULT_KERNELS[0])
    }
}

impl<S: SysOps> Scanner for CatalogBuilder<S> {
    fn scan(&mut self) -> Result<BootConfig> {
        let mut enumerator = match BlockDeviceEnumerator::open(&self.settings.fstypes) {
            Ok(enumerator) => enumerator,
            Err(e) => {
                log::warn!("Device enumeration failed: {:#}", e);
                let mut registry = BootConfig::new();
                registry.timeout = self.settings.timeout;
                return Ok(registry);
            }
        };

        let mut devices = Vec::new();
        while let Some(device) = enumerator.next_device() {
            log::debug!("Device {} ({}, {} blocks)", device.path, device.fstype, device.blocks);
            devices.push(device);
        }

        Ok(self.scan_devices(devices))
    }
}
