//! One-shot helper for running a program to completion.

use tracing::warn;

use crate::cmd::{Cmd, RunStatus};

/// A program and its arguments, run with buffered output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    program: String,
    args: Vec<String>,
}

impl Exec {
    /// Describe `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program path
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run to completion. Captured stderr lines are logged.
    pub async fn run(&self) -> RunStatus {
        let cmd = Cmd::buffered(self.program.clone(), self.args.iter().cloned());
        let status = cmd.start().wait().await;

        let pid = status.pid.unwrap_or_default();
        for line in &status.stderr {
            warn!("[{}] {}: {}", pid, self.program, line);
        }
        if let Some(err) = &status.error {
            warn!(program = %self.program, %err, "command failed");
        }

        status
    }

    /// Stdout lines of a successful run, empty otherwise
    pub async fn lines(&self) -> Vec<String> {
        let status = self.run().await;
        if status.exit == 0 {
            status.stdout
        } else {
            Vec::new()
        }
    }

    /// One stdout line of a successful run, empty when missing
    pub async fn line(&self, index: usize) -> String {
        self.lines()
            .await
            .into_iter()
            .nth(index)
            .unwrap_or_default()
    }
}
