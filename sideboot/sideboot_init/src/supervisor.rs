//! First-process supervision: banner, gesture wait, boot, fallback shell and
//! the final sweep.

use std::io::{self, BufRead};
use std::path::Path;
use std::time::Duration;

use sideboot_boot::{BootOptions, Resolver, SystemHost};
use tracing::{debug, info, warn};

use crate::settings::Settings;
use crate::shell;

const BANNER: &str = r"
      _/_/_/  _/        _/            _/                              _/
   _/              _/_/_/    _/_/    _/_/_/      _/_/      _/_/    _/_/_/_/
    _/_/    _/  _/    _/  _/_/_/_/  _/    _/  _/    _/  _/    _/    _/
       _/  _/  _/    _/  _/        _/    _/  _/    _/  _/    _/    _/
_/_/_/    _/    _/_/_/    _/_/_/  _/_/_/      _/_/      _/_/        _/_/
";

/// Drives one boot from start to exit code
pub struct Supervisor {
    settings: Settings,
    first_process: bool,
    overrides: Vec<String>,
}

impl Supervisor {
    /// Create a supervisor
    pub fn new(settings: Settings, first_process: bool, overrides: Vec<String>) -> Self {
        Self {
            settings,
            first_process,
            overrides,
        }
    }

    /// Boot, or fall back to the shell. Returns the process exit code.
    pub async fn run(&self, mut options: BootOptions) -> i32 {
        if self.first_process {
            print!("{BANNER}");
        }

        if self.first_process && keystroke_within(self.settings.gesture_timeout()).await {
            info!("boot interrupted from the console");
            return self.recovery_shell().await;
        }

        let host = SystemHost::new(
            self.settings.partition_finder.as_str(),
            self.settings.kexec.as_str(),
        );
        let resolver = Resolver::new(
            host,
            self.settings.resolver(self.first_process, &self.overrides),
        );

        match resolver.boot(&mut options).await {
            Ok(booted) => {
                info!(
                    partition = %booted.partition,
                    device = %booted.device,
                    restarts = booted.restarts,
                    "chainload returned"
                );
                shutdown();
                0
            }
            Err(err) => {
                warn!(reason = %err, "boot failed, starting recovery shell");
                self.recovery_shell().await
            }
        }
    }

    async fn recovery_shell(&self) -> i32 {
        if let Err(err) = std::env::set_current_dir(Path::new("/")) {
            warn!(%err, "failed to return to /");
        }

        match shell::run(&self.settings.shell).await {
            Ok(code) => code,
            Err(err) => {
                warn!("{:#}", err);
                -1
            }
        }
    }
}

/// Wait up to `timeout` for a line on stdin.
///
/// End of input or a read error waits out the timer. The reader thread is
/// left behind when the timer wins.
pub async fn keystroke_within(timeout: Duration) -> bool {
    let read = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        matches!(io::stdin().lock().read_line(&mut line), Ok(n) if n > 0)
    });

    tokio::select! {
        _ = tokio::time::sleep(timeout) => false,
        Ok(true) = read => true,
    }
}

/// Reap orphans and flush filesystems
pub fn shutdown() {
    let reaped = reap_orphans();
    debug!(reaped, "orphans reaped");
    // SAFETY: sync has no preconditions.
    unsafe { libc::sync() };
}

fn reap_orphans() -> usize {
    let mut reaped = 0;
    loop {
        let mut status = 0;
        // SAFETY: status is a valid out pointer.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            reaped += 1;
            continue;
        }
        if pid == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return reaped;
    }
}
