//! The side effects the resolver needs from the running system.
//!
//! [`BootHost`] is the seam between boot resolution and the machine: partition
//! lookup, the read-only mount, working directory changes and the kexec-style
//! loader. [`SystemHost`] is the real implementation.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use async_trait::async_trait;
use sideboot_exec::Exec;
use tracing::debug;

/// Default partition finder
pub const DEFAULT_PARTITION_FINDER: &str = "/bin/findfs";

/// Default kexec-style loader
pub const DEFAULT_KEXEC: &str = "/libexec/kexec";

/// Filesystem type the boot partition is mounted as
pub const BOOT_FS_TYPE: &str = "ext2";

/// System operations used during boot resolution
#[async_trait]
pub trait BootHost: Send + Sync {
    /// Resolve a partition label to a device path, `""` when unresolved
    async fn find_partition(&self, label: &str) -> String;

    /// Mount `device` read-only at `target`
    fn mount_readonly(&self, device: &str, target: &Path) -> io::Result<()>;

    /// Unmount `target`
    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Change the working directory
    fn change_dir(&self, dir: &Path) -> io::Result<()>;

    /// Run the loader with `args` and return its exit code
    async fn kexec(&self, args: &[String]) -> i32;
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

fn c_str(text: &str) -> io::Result<CString> {
    CString::new(text).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

/// [`BootHost`] backed by external programs and mount syscalls
#[derive(Debug, Clone)]
pub struct SystemHost {
    partition_finder: String,
    kexec: String,
}

impl SystemHost {
    /// Use the given partition finder and loader programs
    pub fn new(partition_finder: impl Into<String>, kexec: impl Into<String>) -> Self {
        Self {
            partition_finder: partition_finder.into(),
            kexec: kexec.into(),
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITION_FINDER, DEFAULT_KEXEC)
    }
}

#[async_trait]
impl BootHost for SystemHost {
    async fn find_partition(&self, label: &str) -> String {
        Exec::new(self.partition_finder.as_str())
            .arg(label)
            .line(0)
            .await
    }

    fn mount_readonly(&self, device: &str, target: &Path) -> io::Result<()> {
        let source = c_str(device)?;
        let target = c_path(target)?;
        let fstype = c_str(BOOT_FS_TYPE)?;

        // SAFETY: every pointer comes from a live CString; data may be null.
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let target = c_path(target)?;
        // SAFETY: the pointer comes from a live CString.
        if unsafe { libc::umount2(target.as_ptr(), 0) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn change_dir(&self, dir: &Path) -> io::Result<()> {
        std::env::set_current_dir(dir)
    }

    async fn kexec(&self, args: &[String]) -> i32 {
        debug!(loader = %self.kexec, ?args, "running loader");
        Exec::new(self.kexec.as_str())
            .args(args.iter().cloned())
            .run()
            .await
            .exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_finder_first_line() {
        let host = SystemHost::new("/bin/echo", DEFAULT_KEXEC);
        assert_eq!(host.find_partition("LABEL=boot").await, "LABEL=boot");

        let host = SystemHost::new("/bin/true", DEFAULT_KEXEC);
        assert_eq!(host.find_partition("LABEL=boot").await, "");
    }

    #[tokio::test]
    async fn test_loader_exit_code() {
        let host = SystemHost::new(DEFAULT_PARTITION_FINDER, "/bin/false");
        assert_ne!(host.kexec(&["--exec".to_string()]).await, 0);

        let host = SystemHost::new(DEFAULT_PARTITION_FINDER, "/nonexistent/kexec");
        assert_ne!(host.kexec(&["--exec".to_string()]).await, 0);
    }

    #[test]
    fn test_mount_rejects_interior_nul() {
        let host = SystemHost::default();
        let err = host
            .mount_readonly("/dev/bad\0device", Path::new("/tmp"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
