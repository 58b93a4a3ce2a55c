//! Boot resolution.
//!
//! The resolver mounts the partition named by `sideboot.partition`, merges
//! the config found there and repeats until the merged options point at the
//! partition that is already mounted. Only then does it look for the kernel
//! and hand it to the loader.
//!
//! ```text
//! ResolvePartition -> MountSource -> LoadConfig -> MergeOptions
//!        ^                                             |
//!        +------------- partition changed -------------+
//!                                                      |
//!                        ResolveKernel <--- unchanged -+
//!                              |
//!                          Chainload -> Booted | BootError
//! ```
//!
//! Redirects are followed without limit, so two configs naming each other
//! keep the loop going forever. Every hop is logged.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::host::BootHost;
use crate::options::{
    tokenize, BootOptions, OptionSource, ParseError, CMDLINE, CONFIG, KERNEL, PARTITION, RAMDISK,
    SHELL,
};

/// Default scratch mount point
pub const DEFAULT_MOUNT_DIR: &str = "/tmp/boot";

/// Config file read when `sideboot.config` is unset or empty
pub const DEFAULT_CONFIG_FILE: &str = "sideboot.cfg";

/// Loader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Load kernel, ramdisk and commandline
    Load,
    /// Jump into the loaded kernel
    Exec,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => f.write_str("load"),
            Self::Exec => f.write_str("exec"),
        }
    }
}

/// Why boot resolution gave up
#[derive(Debug, Error)]
pub enum BootError {
    /// `sideboot.partition` is unset
    #[error("no boot partition specified")]
    NoPartition,

    /// The partition finder returned nothing
    #[error("label {label} does not resolve to a device")]
    Unresolved {
        /// Partition label
        label: String,
    },

    /// The device could not be mounted
    #[error("failed to mount {device}: {source}")]
    Mount {
        /// Device path
        device: String,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// The boot config is not valid shell-quoted text
    #[error("commandline to next kernel contains garbage: {0}")]
    Garbage(#[source] ParseError),

    /// The options ask for the recovery shell
    #[error("user selected shell")]
    ShellRequested,

    /// `sideboot.kernel` is unset
    #[error("no kernel specified on boot partition {partition}")]
    NoKernel {
        /// Partition label
        partition: String,
    },

    /// The kernel file does not exist
    #[error("kernel {path} not found on boot partition {partition}")]
    KernelMissing {
        /// Partition label
        partition: String,
        /// Configured kernel path
        path: String,
    },

    /// The ramdisk file does not exist
    #[error("ramdisk {path} not found on boot partition {partition}")]
    RamdiskMissing {
        /// Partition label
        partition: String,
        /// Configured ramdisk path
        path: String,
    },

    /// A loader stage exited non-zero
    #[error("kexec {stage} stage failed with exit status {code}")]
    Stage {
        /// Failed stage
        stage: Stage,
        /// Loader exit code
        code: i32,
    },
}

/// Outcome of a chainload whose exec stage returned zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booted {
    /// Label of the partition booted from
    pub partition: String,
    /// Device backing it
    pub device: String,
    /// Redirects followed before settling
    pub restarts: usize,
}

/// Resolver settings
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Scratch mount point
    pub mount_dir: PathBuf,
    /// Config file read when none is named
    pub default_config: String,
    /// Running as the first process
    pub first_process: bool,
    /// Invocation arguments re-applied after each config merge
    pub overrides: Vec<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            mount_dir: PathBuf::from(DEFAULT_MOUNT_DIR),
            default_config: DEFAULT_CONFIG_FILE.to_string(),
            first_process: false,
            overrides: Vec::new(),
        }
    }
}

enum Attempt {
    Redirected { from: String, to: String },
    Booted(Booted),
}

// Restores the working directory and unmounts when dropped, once per mount.
struct MountGuard<'a> {
    host: &'a dyn BootHost,
    target: &'a Path,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.host.change_dir(Path::new("/")) {
            warn!(%err, "failed to return to /");
        }
        if let Err(err) = self.host.unmount(self.target) {
            debug!(target = %self.target.display(), %err, "unmount failed");
        }
    }
}

fn read_config(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => match text.strip_suffix('\n') {
            Some(stripped) => stripped.to_string(),
            None => text,
        },
        Err(err) => {
            debug!(path = %path.display(), %err, "no boot config");
            String::new()
        }
    }
}

/// Iterative boot resolver
pub struct Resolver<H> {
    host: H,
    settings: ResolverSettings,
}

impl<H: BootHost> Resolver<H> {
    /// Create a resolver over `host`
    pub fn new(host: H, settings: ResolverSettings) -> Self {
        Self { host, settings }
    }

    /// The host in use
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The settings in use
    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolve the boot partition and chainload its kernel.
    ///
    /// `options` is updated with every config merged along the way. When the
    /// exec stage succeeds the running system is normally replaced and this
    /// never returns.
    pub async fn boot(&self, options: &mut BootOptions) -> Result<Booted, BootError> {
        let mut restarts = 0;
        loop {
            match self.attempt(options).await? {
                Attempt::Redirected { from, to } => {
                    restarts += 1;
                    info!(%from, %to, restarts, "boot config redirects to another partition");
                }
                Attempt::Booted(booted) => return Ok(Booted { restarts, ..booted }),
            }
        }
    }

    async fn attempt(&self, options: &mut BootOptions) -> Result<Attempt, BootError> {
        let label = options.get(PARTITION).to_string();
        if label.is_empty() {
            return Err(BootError::NoPartition);
        }

        let device = self.host.find_partition(&label).await;
        if device.is_empty() {
            return Err(BootError::Unresolved { label });
        }

        let mount_dir = self.settings.mount_dir.as_path();
        if let Err(err) = fs::create_dir_all(mount_dir) {
            warn!(path = %mount_dir.display(), %err, "failed to create mount point");
        }

        let _mounted = MountGuard {
            host: &self.host,
            target: mount_dir,
        };
        self.host
            .mount_readonly(&device, mount_dir)
            .map_err(|source| BootError::Mount {
                device: device.clone(),
                source,
            })?;
        info!(partition = %label, %device, "boot partition mounted");

        let config = self.load_config(options);
        let tokens = tokenize(OptionSource::Config, &config).map_err(BootError::Garbage)?;
        options.apply_tokens(tokens);
        if self.settings.first_process {
            options.apply_overrides(&self.settings.overrides);
        }

        if self.settings.first_process && options.get(SHELL) == "1" {
            return Err(BootError::ShellRequested);
        }

        let next = options.get(PARTITION);
        if next != label {
            return Ok(Attempt::Redirected {
                from: label,
                to: next.to_string(),
            });
        }

        if let Err(err) = self.host.change_dir(mount_dir) {
            warn!(path = %mount_dir.display(), %err, "failed to enter boot partition");
        }

        let args = self.loader_args(&label, options)?;
        let code = self.host.kexec(&args).await;
        if code != 0 {
            return Err(BootError::Stage {
                stage: Stage::Load,
                code,
            });
        }

        info!(partition = %label, "kernel loaded, executing");
        let code = self.host.kexec(&["--exec".to_string()]).await;
        if code != 0 {
            return Err(BootError::Stage {
                stage: Stage::Exec,
                code,
            });
        }

        Ok(Attempt::Booted(Booted {
            partition: label,
            device,
            restarts: 0,
        }))
    }

    fn load_config(&self, options: &BootOptions) -> String {
        let root = &self.settings.mount_dir;

        let mut text = String::new();
        if options.is_set(CONFIG) {
            text = read_config(&root.join(options.get(CONFIG).trim_start_matches('/')));
        }
        if text.is_empty() {
            text = read_config(&root.join(&self.settings.default_config));
        }

        text.replace('\n', " ")
    }

    fn loader_args(&self, partition: &str, options: &BootOptions) -> Result<Vec<String>, BootError> {
        let root = &self.settings.mount_dir;

        if !options.is_set(KERNEL) {
            return Err(BootError::NoKernel {
                partition: partition.to_string(),
            });
        }
        let kernel = root.join(options.get(KERNEL));
        if !kernel.exists() {
            return Err(BootError::KernelMissing {
                partition: partition.to_string(),
                path: options.get(KERNEL).to_string(),
            });
        }

        let mut args = vec!["--command-line".to_string(), options.get(CMDLINE).to_string()];

        if options.is_set(RAMDISK) {
            let ramdisk = root.join(options.get(RAMDISK));
            if !ramdisk.exists() {
                return Err(BootError::RamdiskMissing {
                    partition: partition.to_string(),
                    path: options.get(RAMDISK).to_string(),
                });
            }
            args.push("--initrd".to_string());
            args.push(ramdisk.to_string_lossy().into_owned());
        }

        args.push("--load".to_string());
        args.push(kernel.to_string_lossy().into_owned());
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, FakeHost};

    fn resolver(host: FakeHost, dir: &Path, first_process: bool) -> Resolver<FakeHost> {
        Resolver::new(
            host,
            ResolverSettings {
                mount_dir: dir.join("boot"),
                first_process,
                ..ResolverSettings::default()
            },
        )
    }

    fn options(partition: &str) -> BootOptions {
        let mut options = BootOptions::with_defaults();
        options.set(PARTITION, partition);
        options
    }

    #[tokio::test]
    async fn test_boots_configured_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/mmcblk0p1",
            &[
                ("sideboot.cfg", "sideboot.kernel=Image\nsideboot.cmdline='console=ttyS0'\n"),
                ("Image", "kernel"),
            ],
        );
        let resolver = resolver(host, dir.path(), false);

        let mut opts = options("BOOT_A");
        let booted = resolver.boot(&mut opts).await.unwrap();
        assert_eq!(booted.partition, "BOOT_A");
        assert_eq!(booted.device, "/dev/mmcblk0p1");
        assert_eq!(booted.restarts, 0);

        let mount_dir = dir.path().join("boot");
        let kernel = mount_dir.join("Image").to_string_lossy().into_owned();
        assert_eq!(
            resolver.host().loader_calls(),
            vec![
                vec!["--command-line".to_string(), "console=ttyS0".into(), "--load".into(), kernel],
                vec!["--exec".to_string()],
            ]
        );
        assert_eq!(resolver.host().mounts(), 1);
        assert_eq!(resolver.host().unmounts(), 1);
        assert_eq!(
            resolver.host().events().last(),
            Some(&Event::Unmounted(mount_dir))
        );
    }

    #[tokio::test]
    async fn test_no_partition() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(FakeHost::new(), dir.path(), false);

        let err = resolver.boot(&mut BootOptions::with_defaults()).await.unwrap_err();
        assert!(matches!(err, BootError::NoPartition));
        assert_eq!(err.to_string(), "no boot partition specified");
        assert_eq!(resolver.host().mounts(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_label() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(FakeHost::new(), dir.path(), false);

        let err = resolver.boot(&mut options("MISSING")).await.unwrap_err();
        assert!(matches!(err, BootError::Unresolved { ref label } if label == "MISSING"));
        assert_eq!(resolver.host().mounts(), 0);
    }

    #[tokio::test]
    async fn test_mount_failure_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().label("BOOT_A", "/dev/unformatted");
        let resolver = resolver(host, dir.path(), false);

        let err = resolver.boot(&mut options("BOOT_A")).await.unwrap_err();
        assert!(matches!(err, BootError::Mount { ref device, .. } if device == "/dev/unformatted"));
        assert_eq!(resolver.host().unmounts(), 1);
        assert_eq!(resolver.host().chdirs_to_root(), 1);
    }

    #[tokio::test]
    async fn test_missing_kernel_names_partition() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_B",
            "/dev/sdb1",
            &[("sideboot.cfg", "sideboot.kernel=vmlinuz-missing")],
        );
        let resolver = resolver(host, dir.path(), false);

        let err = resolver.boot(&mut options("BOOT_B")).await.unwrap_err();
        let reason = err.to_string();
        assert!(reason.contains("BOOT_B"), "{reason}");
        assert!(reason.contains("kernel"), "{reason}");
        assert!(resolver.host().loader_calls().is_empty());
        assert_eq!(resolver.host().unmounts(), 1);
    }

    #[tokio::test]
    async fn test_unset_kernel_names_partition() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk("BOOT_B", "/dev/sdb1", &[]);
        let resolver = resolver(host, dir.path(), false);

        let err = resolver.boot(&mut options("BOOT_B")).await.unwrap_err();
        assert!(matches!(err, BootError::NoKernel { ref partition } if partition == "BOOT_B"));
        assert!(err.to_string().contains("kernel"));
    }

    #[tokio::test]
    async fn test_ramdisk_is_passed_along() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/sda1",
            &[
                ("sideboot.cfg", "sideboot.kernel=bzImage sideboot.ramdisk=initrd.img"),
                ("bzImage", ""),
                ("initrd.img", ""),
            ],
        );
        let resolver = resolver(host, dir.path(), false);

        resolver.boot(&mut options("BOOT_A")).await.unwrap();
        let load = &resolver.host().loader_calls()[0];
        let initrd = load.iter().position(|arg| arg == "--initrd").unwrap();
        assert!(load[initrd + 1].ends_with("initrd.img"));
        assert_eq!(load[initrd + 2], "--load");
    }

    #[tokio::test]
    async fn test_missing_ramdisk() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/sda1",
            &[
                ("sideboot.cfg", "sideboot.kernel=bzImage sideboot.ramdisk=initrd.img"),
                ("bzImage", ""),
            ],
        );
        let resolver = resolver(host, dir.path(), false);

        let err = resolver.boot(&mut options("BOOT_A")).await.unwrap_err();
        assert!(matches!(err, BootError::RamdiskMissing { .. }));
        assert!(resolver.host().loader_calls().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/sda1",
            &[("sideboot.cfg", "sideboot.kernel='unterminated")],
        );
        let resolver = resolver(host, dir.path(), false);

        let mut opts = options("BOOT_A");
        let err = resolver.boot(&mut opts).await.unwrap_err();
        assert!(matches!(err, BootError::Garbage(_)));
        assert!(err.to_string().contains("garbage"));
        assert!(!opts.is_set(KERNEL));
        assert_eq!(resolver.host().mounts(), 1);
        assert_eq!(resolver.host().unmounts(), 1);
    }

    #[tokio::test]
    async fn test_named_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/sda1",
            &[
                ("sideboot.cfg", "sideboot.kernel=default"),
                ("recovery.cfg", "sideboot.kernel=recovery"),
                ("recovery", ""),
            ],
        );
        let resolver = resolver(host, dir.path(), false);

        let mut opts = options("BOOT_A");
        opts.set(CONFIG, "/recovery.cfg");
        resolver.boot(&mut opts).await.unwrap();
        assert_eq!(opts.get(KERNEL), "recovery");
    }

    #[tokio::test]
    async fn test_named_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/sda1",
            &[("sideboot.cfg", "sideboot.kernel=default"), ("default", "")],
        );
        let resolver = resolver(host, dir.path(), false);

        let mut opts = options("BOOT_A");
        opts.set(CONFIG, "absent.cfg");
        resolver.boot(&mut opts).await.unwrap();
        assert_eq!(opts.get(KERNEL), "default");
    }

    #[tokio::test]
    async fn test_shell_request_preempts_boot() {
        let dir = tempfile::tempdir().unwrap();
        let files: &[(&str, &str)] = &[
            ("sideboot.cfg", "sideboot.kernel=Image sideboot.shell=1"),
            ("Image", ""),
        ];

        let host = FakeHost::new().disk("BOOT_A", "/dev/sda1", files);
        let as_init = resolver(host, dir.path(), true);
        let err = as_init.boot(&mut options("BOOT_A")).await.unwrap_err();
        assert!(matches!(err, BootError::ShellRequested));
        assert!(as_init.host().loader_calls().is_empty());
        assert_eq!(as_init.host().unmounts(), 1);

        // Only the first process honours the shell request
        let host = FakeHost::new().disk("BOOT_A", "/dev/sda1", files);
        let chainloader = resolver(host, dir.path(), false);
        chainloader.boot(&mut options("BOOT_A")).await.unwrap();
    }

    #[tokio::test]
    async fn test_overrides_win_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new().disk(
            "BOOT_A",
            "/dev/sda1",
            &[("sideboot.cfg", "sideboot.kernel=Image sideboot.cmdline=quiet"), ("Image", "")],
        );
        let resolver = Resolver::new(
            host,
            ResolverSettings {
                mount_dir: dir.path().join("boot"),
                first_process: true,
                overrides: vec!["--sideboot.cmdline=console=ttyAMA0".into(), "single".into()],
                ..ResolverSettings::default()
            },
        );

        resolver.boot(&mut options("BOOT_A")).await.unwrap();
        assert_eq!(resolver.host().loader_calls()[0][1], "console=ttyAMA0");
    }

    #[tokio::test]
    async fn test_load_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new()
            .disk(
                "BOOT_A",
                "/dev/sda1",
                &[("sideboot.cfg", "sideboot.kernel=Image"), ("Image", "")],
            )
            .loader_exits(&[1]);
        let resolver = resolver(host, dir.path(), false);

        let err = resolver.boot(&mut options("BOOT_A")).await.unwrap_err();
        assert!(matches!(err, BootError::Stage { stage: Stage::Load, code: 1 }));
        assert_eq!(err.to_string(), "kexec load stage failed with exit status 1");
        assert_eq!(resolver.host().loader_calls().len(), 1);

        let mount_dir = dir.path().join("boot");
        let events = resolver.host().events();
        let entered = events
            .iter()
            .position(|event| *event == Event::ChangedDir(mount_dir.clone()))
            .unwrap();
        assert!(matches!(events[entered + 1], Event::Loader(_)));
        assert_eq!(resolver.host().chdirs_to_root(), 1);
    }

    #[tokio::test]
    async fn test_exec_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new()
            .disk(
                "BOOT_A",
                "/dev/sda1",
                &[("sideboot.cfg", "sideboot.kernel=Image"), ("Image", "")],
            )
            .loader_exits(&[0, 255]);
        let resolver = resolver(host, dir.path(), false);

        let err = resolver.boot(&mut options("BOOT_A")).await.unwrap_err();
        assert!(matches!(err, BootError::Stage { stage: Stage::Exec, code: 255 }));
    }
}
