//! Supervisor settings.
//!
//! Settings describe the machine rather than the boot: where the helpers live
//! and which scratch paths to use. They are read from an optional TOML file;
//! any field left out keeps its default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sideboot_boot::{
    ResolverSettings, DEFAULT_CONFIG_FILE, DEFAULT_KEXEC, DEFAULT_MOUNT_DIR,
    DEFAULT_PARTITION_FINDER,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur in settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Scratch mount point for the boot partition
    #[serde(default = "default_mount_dir")]
    pub mount_dir: PathBuf,

    /// Program that resolves a partition label to a device
    #[serde(default = "default_partition_finder")]
    pub partition_finder: String,

    /// kexec-style loader
    #[serde(default = "default_kexec")]
    pub kexec: String,

    /// Recovery shell, program followed by its arguments
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,

    /// Config file read from the boot partition when none is named
    #[serde(default = "default_config")]
    pub default_config: String,

    /// How long the first process waits for a keystroke
    #[serde(default = "default_gesture_timeout_ms")]
    pub gesture_timeout_ms: u64,

    /// Kernel commandline source
    #[serde(default = "default_cmdline_path")]
    pub cmdline_path: PathBuf,
}

fn default_mount_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MOUNT_DIR)
}

fn default_partition_finder() -> String {
    DEFAULT_PARTITION_FINDER.to_string()
}

fn default_kexec() -> String {
    DEFAULT_KEXEC.to_string()
}

fn default_shell() -> Vec<String> {
    vec![
        "/libexec/busybox".to_string(),
        "ash".to_string(),
        "-l".to_string(),
    ]
}

fn default_config() -> String {
    DEFAULT_CONFIG_FILE.to_string()
}

fn default_gesture_timeout_ms() -> u64 {
    1000
}

fn default_cmdline_path() -> PathBuf {
    PathBuf::from("/proc/cmdline")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mount_dir: default_mount_dir(),
            partition_finder: default_partition_finder(),
            kexec: default_kexec(),
            shell: default_shell(),
            default_config: default_config(),
            gesture_timeout_ms: default_gesture_timeout_ms(),
            cmdline_path: default_cmdline_path(),
        }
    }
}

/// Where loaded settings came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    /// No file was given
    Defaults,
    /// The given file does not exist
    Missing(PathBuf),
    /// Read from this file
    File(PathBuf),
}

impl SettingsSource {
    /// Report the source. Call once logging is up.
    pub fn log(&self) {
        match self {
            Self::Defaults => debug!("No settings file specified, using defaults"),
            Self::Missing(path) => warn!("Settings file not found: {}", path.display()),
            Self::File(path) => info!("Loaded settings from {}", path.display()),
        }
    }
}

impl Settings {
    /// Load settings from a file.
    ///
    /// Nothing is logged here; the returned source is reported by the caller.
    pub fn load(path: Option<&Path>) -> Result<(Self, SettingsSource)> {
        let (settings, source) = match path {
            Some(path) if !path.exists() => {
                (Settings::default(), SettingsSource::Missing(path.to_path_buf()))
            }
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
                let settings = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
                (settings, SettingsSource::File(path.to_path_buf()))
            }
            None => (Settings::default(), SettingsSource::Defaults),
        };

        settings.validate()?;
        Ok((settings, source))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.mount_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Mount directory cannot be empty".to_string()).into());
        }

        if self.partition_finder.is_empty() {
            return Err(ConfigError::Invalid("Partition finder cannot be empty".to_string()).into());
        }

        if self.kexec.is_empty() {
            return Err(ConfigError::Invalid("Loader cannot be empty".to_string()).into());
        }

        if self.shell.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::Invalid("Shell program cannot be empty".to_string()).into());
        }

        if self.default_config.is_empty() {
            return Err(ConfigError::Invalid("Default config name cannot be empty".to_string()).into());
        }

        Ok(())
    }

    /// Gesture wait as a duration
    pub fn gesture_timeout(&self) -> Duration {
        Duration::from_millis(self.gesture_timeout_ms)
    }

    /// Resolver settings for this run
    pub fn resolver(&self, first_process: bool, overrides: &[String]) -> ResolverSettings {
        ResolverSettings {
            mount_dir: self.mount_dir.clone(),
            default_config: self.default_config.clone(),
            first_process,
            overrides: overrides.to_vec(),
        }
    }
}
