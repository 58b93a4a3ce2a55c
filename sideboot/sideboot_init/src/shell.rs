//! Recovery shell handoff.

use std::io;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::info;

/// Run the recovery shell on the console and return its exit code.
///
/// The shell gets a new session with stdin as its controlling terminal when
/// the kernel allows it.
pub async fn run(shell: &[String]) -> Result<i32> {
    let Some((program, args)) = shell.split_first() else {
        bail!("no shell configured");
    };

    info!(%program, "starting shell");

    let mut command = Command::new(program);
    command.args(args);

    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0);
            Ok(())
        });
    }

    let status = command
        .status()
        .await
        .with_context(|| format!("Failed to start shell: {program}"))?;

    Ok(status.code().unwrap_or(-1))
}
