//! Configuration: per-partition boot entry records and runtime settings.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Which UI backend to initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiMode {
    #[default]
    Text,
    Graphics,
}

/// One boot entry record, parsed from a TOML file on the boot
/// configuration partition.
///
/// ```toml
/// label = "Stable"
/// device = "/dev/mmcblk0p2"
/// kernel = "/boot/zImage"
/// cmdline = "quiet"
/// initrd = "/boot/initrd.img"
/// priority = 10
/// default = true
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootEntry {
    /// Device the entry boots from. Defaults to the configuration
    /// partition itself.
    pub device: Option<String>,

    /// Kernel image, relative to the partition root.
    pub kernel: Option<PathBuf>,

    /// Extra kernel command line fragment.
    pub cmdline: Option<String>,

    /// Initial ramdisk, relative to the partition root.
    pub initrd: Option<PathBuf>,

    /// Menu label.
    pub label: Option<String>,

    /// Boot directory reported to the booted system.
    pub directory: Option<PathBuf>,

    /// Partition image file name for image-backed boots, relative to the
    /// partition root.
    pub image: Option<String>,

    /// Icon file, relative to the configuration partition root.
    pub icon: Option<PathBuf>,

    /// Menu ordering priority, higher sorts first.
    #[serde(default)]
    pub priority: i32,

    /// Ordinary Linux boot. Entries with `linux = false` are handed to
    /// the alternate init program instead.
    #[serde(default = "default_true")]
    pub linux: bool,

    /// Boot through the external kexec tool.
    #[serde(default = "default_true")]
    pub kexec: bool,

    /// Mark this entry as the autoboot default.
    #[serde(default)]
    pub default: bool,

    /// Registry-wide autoboot timeout override, in seconds.
    pub timeout: Option<u32>,
}

/// Parse one boot entry file. Errors are non-fatal to the overall scan:
/// a file that fails to parse simply contributes no boot item.
pub fn parse_entry(path: &Path) -> Result<BootEntry> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("can't read boot entry '{}'", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("malformed boot entry '{}'", path.display()))
}

/// Runtime settings. Loaded once at startup, then adjusted from the
/// kernel command line, and passed by reference into each component.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root mount point where the selected partition (or loop device)
    /// gets mounted for the kexec load step.
    #[serde(default = "default_root_mount")]
    pub root_mount: PathBuf,

    /// Auxiliary mount point for the boot configuration partition and,
    /// during image-backed boots, for the partition holding the image.
    #[serde(default = "default_boot_mount")]
    pub boot_mount: PathBuf,

    /// Partition holding the boot entry files.
    #[serde(default = "default_conf_device")]
    pub conf_device: String,

    /// Filesystem type of the configuration partition.
    #[serde(default = "default_conf_fstype")]
    pub conf_fstype: String,

    /// Directory of boot entry files, relative to the configuration
    /// partition root.
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Loop device used for image-backed boots.
    #[serde(default = "default_loop_device")]
    pub loop_device: PathBuf,

    /// External kexec tool.
    #[serde(default = "default_kexec_path")]
    pub kexec_path: PathBuf,

    /// Program that replaces this process for non-Linux boot items.
    #[serde(default = "default_alt_init")]
    pub alt_init: PathBuf,

    /// --mem-min argument handed to the kexec load step.
    #[serde(default = "default_mem_min")]
    pub mem_min: String,

    /// Acceptable filesystem type names for the device scan.
    #[serde(default = "default_fstypes")]
    pub fstypes: Vec<String>,

    /// Simulate reboot/shutdown instead of issuing the syscall.
    #[serde(default)]
    pub host_debug: bool,

    /// Verbose diagnostics.
    #[serde(default)]
    pub debug: bool,

    /// UI backend.
    #[serde(default)]
    pub ui: UiMode,

    /// Seconds before the first boot item autoboots (0 - disabled).
    #[serde(default)]
    pub timeout: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_mount: default_root_mount(),
            boot_mount: default_boot_mount(),
            conf_device: default_conf_device(),
            conf_fstype: default_conf_fstype(),
            conf_dir: default_conf_dir(),
            loop_device: default_loop_device(),
            kexec_path: default_kexec_path(),
            alt_init: default_alt_init(),
            mem_min: default_mem_min(),
            fstypes: default_fstypes(),
            host_debug: false,
            debug: false,
            ui: UiMode::Text,
            timeout: 0,
        }
    }
}

impl Settings {
    /// Load settings from the first config file that parses, falling
    /// back to the defaults.
    pub fn load() -> Self {
        let config_paths = ["/etc/raven/bootmenu.toml", "/etc/bootmenu.toml"];

        for path in &config_paths {
            if Path::new(path).exists() {
                if let Ok(content) = fs::read_to_string(path) {
                    match toml::from_str(&content) {
                        Ok(settings) => {
                            log::info!("Loaded settings from {}", path);
                            return settings;
                        }
                        Err(e) => log::warn!("Ignoring malformed {}: {}", path, e),
                    }
                }
            }
        }

        log::info!("Using default settings");
        Self::default()
    }

    /// Apply overrides from the running kernel's command line.
    pub fn apply_cmdline_overrides(&mut self, cmdline: &str) {
        for arg in cmdline.split_whitespace() {
            if let Some(value) = arg.strip_prefix("raven.boot.timeout=") {
                match value.parse() {
                    Ok(secs) => self.timeout = secs,
                    Err(_) => log::warn!("Ignoring bad raven.boot.timeout value '{}'", value),
                }
            } else if let Some(value) = arg.strip_prefix("raven.boot.debug=") {
                self.debug = value == "1" || value == "on";
            } else if arg == "raven.boot.hostdebug" {
                self.host_debug = true;
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_root_mount() -> PathBuf {
    PathBuf::from("/rootfs")
}

fn default_boot_mount() -> PathBuf {
    PathBuf::from("/mnt")
}

fn default_conf_device() -> String {
    "/dev/mmcblk0p1".to_string()
}

fn default_conf_fstype() -> String {
    "vfat".to_string()
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("boot.d")
}

fn default_loop_device() -> PathBuf {
    PathBuf::from("/dev/loop0")
}

fn default_kexec_path() -> PathBuf {
    PathBuf::from("/usr/sbin/kexec")
}

fn default_alt_init() -> PathBuf {
    PathBuf::from("/init-android")
}

fn default_mem_min() -> String {
    "0x84000000".to_string()
}

fn default_fstypes() -> Vec<String> {
    ["ext4", "ext3", "ext2", "vfat"].iter().map(|s| s.to_string()).collect()
}
