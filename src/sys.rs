//! Kernel-facing operations behind one trait so the boot executor's
//! unwind behavior and the scanner's mount lifecycle stay testable.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use nix::sys::reboot::RebootMode;

// From linux/loop.h.
nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);

/// Mounts, loop devices, power management and process replacement.
/// `LinuxSys` is the real thing; tests substitute a state-tracking fake.
pub trait SysOps {
    /// Mount `source` at `target`, creating the mount point if needed.
    fn mount(&mut self, source: &str, target: &Path, fstype: &str, readonly: bool) -> Result<()>;

    fn unmount(&mut self, target: &Path) -> Result<()>;

    /// Attach a regular file to a loop block device.
    fn loop_attach(&mut self, loop_dev: &Path, backing: &Path) -> Result<()>;

    fn loop_detach(&mut self, loop_dev: &Path) -> Result<()>;

    /// Command line of the currently running kernel.
    fn kernel_cmdline(&mut self) -> Result<String>;

    /// Stage a kernel with the external kexec tool.
    fn kexec_load(
        &mut self,
        kexec: &Path,
        kernel: &Path,
        initrd: Option<&Path>,
        mem_min: &str,
        cmdline: &str,
    ) -> Result<()>;

    /// Jump to the staged kernel. Does not return on success.
    fn kexec_exec(&mut self, kexec: &Path) -> Result<Infallible>;

    /// Replace this process with an alternate init program. Does not
    /// return on success.
    fn exec_alternate_init(&mut self, path: &Path) -> Result<Infallible>;

    fn reboot(&mut self) -> Result<()>;

    fn poweroff(&mut self) -> Result<()>;

    /// Flush filesystem buffers.
    fn sync(&mut self);
}

/// Real implementation on the Linux syscall interface.
pub struct LinuxSys;

impl SysOps for LinuxSys {
    fn mount(&mut self, source: &str, target: &Path, fstype: &str, readonly: bool) -> Result<()> {
        fs::create_dir_all(target).ok();

        let flags = if readonly { MsFlags::MS_RDONLY } else { MsFlags::empty() };
        nix::mount::mount(Some(source), target, Some(fstype), flags, None::<&str>)
            .with_context(|| format!("Failed to mount {} on {}", source, target.display()))?;

        log::debug!("Mounted {} on {}", source, target.display());
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        nix::mount::umount(target)
            .with_context(|| format!("Failed to unmount {}", target.display()))?;

        log::debug!("Unmounted {}", target.display());
        Ok(())
    }

    fn loop_attach(&mut self, loop_dev: &Path, backing: &Path) -> Result<()> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(backing)
            .with_context(|| format!("Failed to open boot image '{}'", backing.display()))?;
        let dev = File::options()
            .read(true)
            .write(true)
            .open(loop_dev)
            .with_context(|| format!("Failed to open loop device '{}'", loop_dev.display()))?;

        unsafe { loop_set_fd(dev.as_raw_fd(), file.as_raw_fd()) }
            .with_context(|| format!("LOOP_SET_FD on {} failed", loop_dev.display()))?;

        log::debug!("Attached {} to {}", backing.display(), loop_dev.display());
        Ok(())
    }

    fn loop_detach(&mut self, loop_dev: &Path) -> Result<()> {
        let dev = File::options()
            .read(true)
            .write(true)
            .open(loop_dev)
            .with_context(|| format!("Failed to open loop device '{}'", loop_dev.display()))?;

        unsafe { loop_clr_fd(dev.as_raw_fd()) }
            .with_context(|| format!("LOOP_CLR_FD on {} failed", loop_dev.display()))?;

        log::debug!("Detached {}", loop_dev.display());
        Ok(())
    }

    fn kernel_cmdline(&mut self) -> Result<String> {
        let cmdline =
            fs::read_to_string("/proc/cmdline").context("Failed to read /proc/cmdline")?;
        Ok(cmdline.trim_end().to_string())
    }

    fn kexec_load(
        &mut self,
        kexec: &Path,
        kernel: &Path,
        initrd: Option<&Path>,
        mem_min: &str,
        cmdline: &str,
    ) -> Result<()> {
        let mut cmd = Command::new(kexec);
        cmd.arg("--load-hardboot").arg(kernel);
        if let Some(initrd) = initrd {
            cmd.arg(format!("--initrd={}", initrd.display()));
        }
        cmd.arg(format!("--mem-min={}", mem_min));
        cmd.arg(format!("--command-line={}", cmdline));

        log::info!("Staging kernel: {:?}", cmd);
        let status = cmd
            .status()
            .with_context(|| format!("Failed to run '{}'", kexec.display()))?;
        if !status.success() {
            bail!("kexec load exited with {}", status);
        }
        Ok(())
    }

    fn kexec_exec(&mut self, kexec: &Path) -> Result<Infallible> {
        let status = Command::new(kexec)
            .arg("-e")
            .status()
            .with_context(|| format!("Failed to run '{}'", kexec.display()))?;

        // Control only comes back here when the jump failed.
        bail!("kexec execute returned with {}", status);
    }

    fn exec_alternate_init(&mut self, path: &Path) -> Result<Infallible> {
        let prog = CString::new(path.as_os_str().as_bytes())
            .context("alternate init path contains a NUL byte")?;
        let never = nix::unistd::execv(&prog, &[prog.as_c_str()])
            .with_context(|| format!("Failed to exec '{}'", path.display()))?;
        Ok(never)
    }

    fn reboot(&mut self) -> Result<()> {
        self.sync();
        match nix::sys::reboot::reboot(RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(e) => Err(e).context("reboot syscall failed"),
        }
    }

    fn poweroff(&mut self) -> Result<()> {
        self.sync();
        match nix::sys::reboot::reboot(RebootMode::RB_POWER_OFF) {
            Ok(never) => match never {},
            Err(e) => Err(e).context("poweroff syscall failed"),
        }
    }

    fn sync(&mut self) {
        unsafe {
            libc::sync();
        }
    }
}

/// True when we run as the init process.
pub fn is_init_process() -> bool {
    std::process::id() == 1
}

/// Early mounts for init mode: devtmpfs, procfs and sysfs, plus a quiet
/// console printk level. procfs and sysfs failures are fatal; the kexec
/// path depends on /proc and the device scan on /sys.
pub fn init_early_mounts(sys: &mut dyn SysOps) -> Result<()> {
    if let Err(e) = sys.mount("devtmpfs", Path::new("/dev"), "devtmpfs", false) {
        log::warn!("Can't mount devtmpfs: {:#}", e);
    }
    sys.mount("proc", Path::new("/proc"), "proc", false)?;
    sys.mount("sysfs", Path::new("/sys"), "sysfs", false)?;

    // CONFIG_PRINTK may be disabled.
    if let Err(e) = fs::write("/proc/sys/kernel/printk", "0 4 1 7\n") {
        log::warn!("Can't set console loglevel: {}", e);
    }

    log::info!("Essential filesystems mounted");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    /// State-tracking double for `SysOps`. Records every operation and
    /// keeps a live mount/loop table so tests can compare resource state
    /// before and after a call.
    #[derive(Default)]
    pub(crate) struct FakeSys {
        /// target -> source of currently mounted filesystems
        pub mounted: BTreeMap<PathBuf, String>,
        /// backing file of the currently attached loop device
        pub loop_backing: Option<PathBuf>,
        /// chronological operation log
        pub ops: Vec<String>,
        pub cmdline: String,
        pub fail_mount_targets: Vec<PathBuf>,
        pub fail_loop_attach: bool,
        pub fail_kexec_load: bool,
        pub fail_cmdline: bool,
        pub reboots: u32,
        pub poweroffs: u32,
    }

    impl FakeSys {
        pub fn with_cmdline(cmdline: &str) -> Self {
            Self { cmdline: cmdline.to_string(), ..Self::default() }
        }
    }

    impl SysOps for FakeSys {
        fn mount(
            &mut self,
            source: &str,
            target: &Path,
            fstype: &str,
            readonly: bool,
        ) -> Result<()> {
            if self.fail_mount_targets.contains(&target.to_path_buf()) {
                bail!("mount {} on {} refused", source, target.display());
            }
            self.ops.push(format!(
                "mount {} {} {}{}",
                source,
                target.display(),
                fstype,
                if readonly { " ro" } else { "" }
            ));
            self.mounted.insert(target.to_path_buf(), source.to_string());
            Ok(())
        }

        fn unmount(&mut self, target: &Path) -> Result<()> {
            self.ops.push(format!("umount {}", target.display()));
            if self.mounted.remove(target).is_none() {
                bail!("{} is not mounted", target.display());
            }
            Ok(())
        }

        fn loop_attach(&mut self, loop_dev: &Path, backing: &Path) -> Result<()> {
            if self.fail_loop_attach {
                bail!("LOOP_SET_FD on {} refused", loop_dev.display());
            }
            self.ops.push(format!("loop-attach {}", backing.display()));
            self.loop_backing = Some(backing.to_path_buf());
            Ok(())
        }

        fn loop_detach(&mut self, loop_dev: &Path) -> Result<()> {
            self.ops.push(format!("loop-detach {}", loop_dev.display()));
            if self.loop_backing.take().is_none() {
                bail!("{} has no backing file", loop_dev.display());
            }
            Ok(())
        }

        fn kernel_cmdline(&mut self) -> Result<String> {
            if self.fail_cmdline {
                bail!("no /proc/cmdline");
            }
            Ok(self.cmdline.clone())
        }

        fn kexec_load(
            &mut self,
            _kexec: &Path,
            kernel: &Path,
            initrd: Option<&Path>,
            _mem_min: &str,
            cmdline: &str,
        ) -> Result<()> {
            if self.fail_kexec_load {
                bail!("kexec load exited with 1");
            }
            self.ops.push(format!(
                "kexec-load {} initrd={} cmdline={}",
                kernel.display(),
                initrd.map(|p| p.display().to_string()).unwrap_or_default(),
                cmdline
            ));
            Ok(())
        }

        fn kexec_exec(&mut self, _kexec: &Path) -> Result<Infallible> {
            self.ops.push("kexec-exec".to_string());
            bail!("kexec execute returned");
        }

        fn exec_alternate_init(&mut self, path: &Path) -> Result<Infallible> {
            self.ops.push(format!("exec {}", path.display()));
            bail!("exec returned");
        }

        fn reboot(&mut self) -> Result<()> {
            self.reboots += 1;
            Ok(())
        }

        fn poweroff(&mut self) -> Result<()> {
            self.poweroffs += 1;
            Ok(())
        }

        fn sync(&mut self) {
            self.ops.push("sync".to_string());
        }
    }
}
