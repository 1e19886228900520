//! Boot item catalog: scanned devices, resolved boot items and the
//! registry one scan pass produces.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};

/// A block device found by one scan pass. Owned by the catalog builder
/// for the duration of the pass.
#[derive(Debug, Clone)]
pub struct Device {
    /// Device node path (/dev/mmcblk0p1)
    pub path: String,
    /// Filesystem type (ext4)
    pub fstype: String,
    /// Device size in 1 KiB blocks
    pub blocks: u64,
}

/// Device classification. Drives icon/UI hints only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Storage,
    Mmc,
    Mtd,
}

impl DeviceType {
    /// Classify a device by its node name.
    pub fn from_device_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        if name.starts_with("mmcblk") {
            DeviceType::Mmc
        } else if name.starts_with("mtd") {
            DeviceType::Mtd
        } else if name.starts_with("sd") || name.starts_with("hd") || name.starts_with("nvme") {
            DeviceType::Storage
        } else {
            DeviceType::Unknown
        }
    }

    /// Short tag shown next to menu entries by the text renderer.
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceType::Storage => "sd",
            DeviceType::Mmc => "mmc",
            DeviceType::Mtd => "mtd",
            DeviceType::Unknown => "??",
        }
    }
}

/// Icon attached to a boot item. The pixmap bytes come off the boot
/// configuration partition while it is mounted; the data is shared
/// between the catalog item and any menu entry built from it.
#[derive(Debug, Clone)]
pub struct Icon {
    pub data: Arc<[u8]>,
}

impl Icon {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

/// How a boot item must be launched. The flags are combinable: an
/// image-backed kexec boot sets both `image` and `kexec`. An item with
/// `linux` unset is handed to the alternate init instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootType {
    pub linux: bool,
    pub image: bool,
    pub kexec: bool,
}

impl Default for BootType {
    fn default() -> Self {
        Self { linux: true, image: false, kexec: true }
    }
}

/// One fully resolved bootable candidate. Immutable once inserted into
/// the registry.
#[derive(Debug, Clone)]
pub struct BootItem {
    /// Device node path (/dev/mmcblk0p1)
    pub device: String,
    /// Filesystem type (ext4)
    pub fstype: String,
    /// Device size in 1 KiB blocks
    pub blocks: u64,
    /// Partition label, if the configuration names one
    pub label: Option<String>,
    /// Kernel image path, relative to the partition root (/boot/zImage)
    pub kernel: PathBuf,
    /// Extra kernel command line fragment
    pub cmdline: Option<String>,
    /// Initial ramdisk, relative to the partition root
    pub initrd: Option<PathBuf>,
    /// Boot directory passed to the booted kernel
    pub directory: Option<PathBuf>,
    /// Partition image file name
    pub image: Option<String>,
    /// Resolved image file path under the auxiliary mount point
    pub image_path: Option<PathBuf>,
    /// Icon shown next to the menu entry
    pub icon: Option<Icon>,
    /// Device classification (UI hint only)
    pub dtype: DeviceType,
    /// How this item must be launched
    pub boot_type: BootType,
    /// Menu ordering priority, higher sorts first
    pub priority: i32,
}

impl BootItem {
    /// Label shown in the menu: the custom label if present, otherwise a
    /// fragment derived from the kernel path.
    pub fn display_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self
                .kernel
                .to_string_lossy()
                .trim_start_matches('/')
                .to_string(),
        }
    }
}

/// The registry of boot items produced by one scan pass. Replaced
/// wholesale, never mutated in place, on rescan.
#[derive(Debug, Default)]
pub struct BootConfig {
    items: Vec<BootItem>,
    default_index: Option<usize>,
    /// Seconds before the first item autoboots (0 - disabled)
    pub timeout: u32,
}

impl BootConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { items: Vec::with_capacity(capacity), ..Self::default() }
    }

    /// Append an item, growing capacity on demand. Returns its index.
    pub fn push(&mut self, item: BootItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Mark an existing item as the autoboot default. Only an item with
    /// the Linux boot type may become the default.
    pub fn set_default(&mut self, index: usize) -> Result<()> {
        let Some(item) = self.items.get(index) else {
            bail!("no boot item at index {index}");
        };
        if !item.boot_type.linux {
            bail!("'{}' is not a Linux boot item and can't be the default", item.display_label());
        }
        self.default_index = Some(index);
        Ok(())
    }

    pub fn default_item(&self) -> Option<&BootItem> {
        self.default_index.and_then(|i| self.items.get(i))
    }

    pub fn item(&self, index: usize) -> Option<&BootItem> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[BootItem] {
        &self.items
    }

    /// Filled item count.
    pub fn fill(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
