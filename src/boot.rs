//! Boot executor: mounts the selected item's filesystem, optionally
//! through a loop device over an image file, stages the kernel with the
//! external kexec tool and jumps to it. Any failure unwinds every mount
//! and loop attachment made during the attempt.

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::catalog::BootItem;
use crate::config::Settings;
use crate::sys::SysOps;

/// Filesystem inside partition image files.
const IMAGE_FSTYPE: &str = "ext4";

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot type is not supported (neither kexec nor alternate init)")]
    Unsupported,

    #[error("can't read the active kernel command line: {0}")]
    Cmdline(anyhow::Error),

    #[error("can't mount '{device}' on {}: {err}", target.display())]
    Mount { device: String, target: PathBuf, err: anyhow::Error },

    #[error("can't attach boot image '{}': {err}", image.display())]
    LoopAttach { image: PathBuf, err: anyhow::Error },

    #[error("selected item is image-backed but resolves no image path")]
    MissingImage,

    #[error("kexec load failed: {0}")]
    KexecLoad(anyhow::Error),

    #[error("kexec execute returned: {0}")]
    KexecExec(anyhow::Error),

    #[error("can't start alternate init '{}': {err}", path.display())]
    AltInit { path: PathBuf, err: anyhow::Error },
}

/// Mount and loop state acquired during one boot attempt, unwound in
/// reverse order when the attempt fails.
#[derive(Default)]
struct Acquired {
    root_mounted: bool,
    aux_mounted: bool,
    loop_attached: bool,
}

impl Acquired {
    /// Best-effort rollback; unwind errors are logged, not escalated.
    fn rollback(&mut self, sys: &mut dyn SysOps, settings: &Settings) {
        if self.root_mounted {
            if let Err(e) = sys.unmount(&settings.root_mount) {
                log::warn!("Unwind: {:#}", e);
            }
            self.root_mounted = false;
        }
        if self.loop_attached {
            if let Err(e) = sys.loop_detach(&settings.loop_device) {
                log::warn!("Unwind: {:#}", e);
            }
            self.loop_attached = false;
        }
        if self.aux_mounted {
            if let Err(e) = sys.unmount(&settings.boot_mount) {
                log::warn!("Unwind: {:#}", e);
            }
            self.aux_mounted = false;
        }
    }
}

/// Compose the command line handed to the new kernel: the running
/// kernel's command line plus a partition token and either an image or
/// a directory token.
pub fn compose_cmdline(current: &str, item: &BootItem) -> String {
    let mut line = String::from(current.trim_end());

    if let Some(extra) = item.cmdline.as_deref() {
        line.push(' ');
        line.push_str(extra);
    }

    line.push_str(" partition=");
    line.push_str(&item.device);

    match (item.boot_type.image, item.image.as_deref()) {
        (true, Some(image)) => {
            line.push_str(" image=");
            line.push_str(image);
        }
        _ => {
            line.push_str(" directory=");
            line.push_str(
                &item
                    .directory
                    .as_deref()
                    .unwrap_or(Path::new("/boot"))
                    .to_string_lossy(),
            );
        }
    }

    line
}

/// Resolve a partition-relative path under the root mount point.
fn under_root(settings: &Settings, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(rel) => settings.root_mount.join(rel),
        Err(_) => settings.root_mount.join(path),
    }
}

/// Boot the selected item. Does not return on success; on failure the
/// mount and loop state is exactly what it was before the call.
pub fn boot(
    sys: &mut dyn SysOps,
    settings: &Settings,
    item: &BootItem,
) -> Result<Infallible, BootError> {
    // Non-Linux items are handed to the alternate init program.
    if !item.boot_type.linux {
        log::info!("Starting alternate init '{}'", settings.alt_init.display());
        return sys
            .exec_alternate_init(&settings.alt_init)
            .map_err(|err| BootError::AltInit { path: settings.alt_init.clone(), err });
    }

    // A Linux item without the kexec flag has no way to boot. Reject it
    // before any mount state exists.
    if !item.boot_type.kexec {
        return Err(BootError::Unsupported);
    }

    // Same for a missing command line: fail before touching mounts.
    let current_cmdline = sys.kernel_cmdline().map_err(BootError::Cmdline)?;

    let mut acquired = Acquired::default();

    if item.boot_type.image {
        let Some(image_path) = item.image_path.as_deref() else {
            return Err(BootError::MissingImage);
        };

        // The partition holding the image goes on the auxiliary mount
        // point; the loop device over the image becomes the root.
        if let Err(err) = sys.mount(&item.device, &settings.boot_mount, &item.fstype, false) {
            return Err(BootError::Mount {
                device: item.device.clone(),
                target: settings.boot_mount.clone(),
                err,
            });
        }
        acquired.aux_mounted = true;

        if let Err(err) = sys.loop_attach(&settings.loop_device, image_path) {
            acquired.rollback(sys, settings);
            return Err(BootError::LoopAttach { image: image_path.to_path_buf(), err });
        }
        acquired.loop_attached = true;

        let loop_device = settings.loop_device.display().to_string();
        if let Err(err) = sys.mount(&loop_device, &settings.root_mount, IMAGE_FSTYPE, false) {
            acquired.rollback(sys, settings);
            return Err(BootError::Mount {
                device: loop_device,
                target: settings.root_mount.clone(),
                err,
            });
        }
        acquired.root_mounted = true;

        log::info!("Boot image mounted");
    } else {
        if let Err(err) = sys.mount(&item.device, &settings.root_mount, &item.fstype, false) {
            return Err(BootError::Mount {
                device: item.device.clone(),
                target: settings.root_mount.clone(),
                err,
            });
        }
        acquired.root_mounted = true;
    }

    let cmdline = compose_cmdline(&current_cmdline, item);
    let kernel = under_root(settings, &item.kernel);
    let initrd = item.initrd.as_deref().map(|p| under_root(settings, p));

    if let Err(err) = sys.kexec_load(
        &settings.kexec_path,
        &kernel,
        initrd.as_deref(),
        &settings.mem_min,
        &cmdline,
    ) {
        acquired.rollback(sys, settings);
        return Err(BootError::KexecLoad(err));
    }

    // The kernel is staged; release everything before the jump.
    acquired.rollback(sys, settings);

    sys.kexec_exec(&settings.kexec_path).map_err(BootError::KexecExec)
}
