#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Sideboot Boot
//!
//! Boot option handling and the partition-redirecting resolver.
//!
//! - [`options`]: the `key=value` store merged from the kernel commandline,
//!   the on-disk boot config and invocation overrides
//! - [`host`]: the [`BootHost`] seam over partition lookup, mounting and the
//!   loader, plus the [`SystemHost`] implementation
//! - [`resolver`]: mount, merge, follow redirects, then chainload

pub mod host;
pub mod options;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use host::{BootHost, SystemHost, BOOT_FS_TYPE, DEFAULT_KEXEC, DEFAULT_PARTITION_FINDER};
pub use options::{tokenize, BootOptions, OptionSource, ParseError};
pub use resolver::{
    BootError, Booted, Resolver, ResolverSettings, Stage, DEFAULT_CONFIG_FILE, DEFAULT_MOUNT_DIR,
};
