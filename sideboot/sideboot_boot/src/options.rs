//! Boot option store.
//!
//! Options are plain `key -> value` strings merged from the kernel
//! commandline, the boot config on disk and invocation overrides, in that
//! order of increasing precedence. A missing key and an empty value both read
//! as unset.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Path of the next kernel, relative to the boot partition
pub const KERNEL: &str = "sideboot.kernel";
/// `"1"` drops into the recovery shell instead of booting
pub const SHELL: &str = "sideboot.shell";
/// Optional ramdisk path, relative to the boot partition
pub const RAMDISK: &str = "sideboot.ramdisk";
/// Commandline handed to the next kernel
pub const CMDLINE: &str = "sideboot.cmdline";
/// Label of the boot partition
pub const PARTITION: &str = "sideboot.partition";
/// Config file name on the boot partition
pub const CONFIG: &str = "sideboot.config";
/// `"1"` enables debug logging
pub const DEBUG: &str = "debug";
/// Kernel console log level
pub const LOGLEVEL: &str = "loglevel";

/// Commandline passed on when none is configured
pub const DEFAULT_CMDLINE: &str = "console=tty1 loglevel=4";

/// Prefix an invocation argument needs to count as an override
pub const OVERRIDE_PREFIX: &str = "--";

/// Where a piece of option text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSource {
    /// Kernel commandline
    Cmdline,
    /// Boot config file
    Config,
    /// Invocation arguments
    Override,
}

impl fmt::Display for OptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cmdline => "kernel commandline",
            Self::Config => "boot config",
            Self::Override => "override arguments",
        };
        f.write_str(name)
    }
}

/// Malformed shell quoting
#[derive(Debug, Error)]
#[error("malformed {origin}: {source}")]
pub struct ParseError {
    /// Which text failed to parse
    pub origin: OptionSource,
    #[source]
    source: shell_words::ParseError,
}

/// Split shell-quoted text into words
pub fn tokenize(origin: OptionSource, text: &str) -> Result<Vec<String>, ParseError> {
    shell_words::split(text).map_err(|source| ParseError { origin, source })
}

/// The merged option mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootOptions {
    values: BTreeMap<String, String>,
}

impl BootOptions {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with every known key
    pub fn with_defaults() -> Self {
        let mut options = Self::new();
        for key in [PARTITION, SHELL, KERNEL, RAMDISK, CONFIG, DEBUG] {
            options.set(key, "");
        }
        options.set(CMDLINE, DEFAULT_CMDLINE);
        options.set(LOGLEVEL, "4");
        options
    }

    /// Value of `key`, `""` when missing
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    /// Whether `key` holds a non-empty value
    pub fn is_set(&self, key: &str) -> bool {
        !self.get(key).is_empty()
    }

    /// Store `value` under `key`, replacing any earlier value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// All entries, sorted by key
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply `key` / `key=value` words
    pub fn apply_tokens<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let (key, value) = split_token(token.as_ref());
            if !key.is_empty() {
                self.set(key, value);
            }
        }
    }

    /// Apply invocation arguments. Only those starting with `--` are
    /// considered; the prefix is stripped.
    pub fn apply_overrides<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = args
            .into_iter()
            .filter_map(|arg| arg.as_ref().strip_prefix(OVERRIDE_PREFIX).map(str::to_owned));
        self.apply_tokens(words);
    }

    /// Merge all three sources in precedence order.
    ///
    /// Text that fails to parse contributes nothing; the failures are
    /// returned so the caller can report them.
    pub fn merge<S: AsRef<str>>(
        &mut self,
        cmdline: &str,
        config: &str,
        overrides: &[S],
    ) -> Vec<ParseError> {
        let mut failures = Vec::new();

        for (origin, text) in [(OptionSource::Cmdline, cmdline), (OptionSource::Config, config)] {
            match tokenize(origin, text) {
                Ok(tokens) => self.apply_tokens(tokens),
                Err(err) => failures.push(err),
            }
        }
        self.apply_overrides(overrides);

        failures
    }
}

// A bare word is a flag whose value is its own name.
fn split_token(token: &str) -> (&str, &str) {
    token.split_once('=').unwrap_or((token, token))
}
