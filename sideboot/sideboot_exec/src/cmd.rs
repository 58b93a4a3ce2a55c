//! Process runner.
//!
//! A [`Cmd`] owns exactly one OS process. It is configured from an immutable
//! [`CommandSpec`], started at most once, and observed through cloned
//! [`RunStatus`] snapshots. The child runs in its own process group so
//! [`Cmd::stop`] reaches everything it spawned.
//!
//! ```text
//! NotStarted --start--> Starting --spawned--> Running --exited--> Done
//!                           \------------spawn failed------------/
//! ```
//!
//! "Stop requested" is a flag next to the phase, not a phase of its own: a stop
//! can race with a natural exit.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::output::{
    FanOut, LineStream, OutputBuffer, OutputSink, DEFAULT_LINE_BUFFER_SIZE,
    DEFAULT_STREAM_CHAN_SIZE,
};

/// Exit code recorded while a process has not terminated normally
pub const EXIT_UNSET: i32 = -1;

const READ_CHUNK: usize = 4096;

/// Errors reported by the process runner
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// The command has not been started (or never got a pid)
    #[error("command not running")]
    NotStarted,

    /// The program could not be spawned
    #[error("failed to start {program}: {reason}")]
    Start {
        /// Program path
        program: String,
        /// OS error text
        reason: String,
    },

    /// The process was terminated by a signal
    #[error("terminated by signal {signal}")]
    Signaled {
        /// Signal number
        signal: i32,
    },

    /// Waiting for the process failed
    #[error("failed to wait for process: {0}")]
    Wait(String),

    /// Delivering the terminate signal failed
    #[error("failed to signal process group {pgid}: {reason}")]
    Signal {
        /// Target process group
        pgid: i32,
        /// OS error text
        reason: String,
    },
}

/// How a command's stdout and stderr are captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Discard both streams
    Discard,
    /// Buffer stdout and stderr separately
    #[default]
    Buffered,
    /// Buffer stdout and stderr interleaved into the stdout lines
    Combined,
    /// Stream stdout and stderr lines onto channels
    Streaming,
    /// Stream lines and buffer them for the final snapshot
    BufferedStreaming,
    /// Stream lines and buffer both streams into the stdout lines
    CombinedStreaming,
}

impl OutputMode {
    fn buffers(self) -> bool {
        !matches!(self, Self::Discard | Self::Streaming)
    }

    fn combines(self) -> bool {
        matches!(self, Self::Combined | Self::CombinedStreaming)
    }

    fn streams(self) -> bool {
        matches!(
            self,
            Self::Streaming | Self::BufferedStreaming | Self::CombinedStreaming
        )
    }
}

/// Immutable description of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path
    pub name: String,
    /// Arguments in order
    pub args: Vec<String>,
    /// Working directory, inherited when unset
    pub dir: Option<PathBuf>,
    /// Full replacement environment, inherited when unset
    pub env: Option<Vec<(String, String)>>,
    /// Output capture mode
    pub mode: OutputMode,
    /// Window size for streamed lines
    pub line_buffer_size: usize,
}

impl CommandSpec {
    /// Describe `name` with no arguments and buffered output
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            dir: None,
            env: None,
            mode: OutputMode::default(),
            line_buffer_size: DEFAULT_LINE_BUFFER_SIZE,
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

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Replace the environment
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Set the output capture mode
    pub fn output(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the streaming window size
    pub fn line_buffer_size(mut self, size: usize) -> Self {
        self.line_buffer_size = size;
        self
    }
}

/// Point-in-time view of a command
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    /// Program path
    pub cmd: String,
    /// Process id, unset until spawned
    pub pid: Option<u32>,
    /// Exited on its own, neither signaled nor stopped
    pub complete: bool,
    /// Exit code, [`EXIT_UNSET`] until a normal exit
    pub exit: i32,
    /// Start failure or signal termination
    pub error: Option<ProcessError>,
    /// Terminated by a signal
    pub signaled: bool,
    /// Spawn time
    pub start_ts: Option<DateTime<Utc>>,
    /// Exit time
    pub stop_ts: Option<DateTime<Utc>>,
    /// Elapsed runtime, live while running
    pub runtime: Duration,
    /// Captured stdout lines (stdout and stderr when combined)
    pub stdout: Vec<String>,
    /// Captured stderr lines
    pub stderr: Vec<String>,
}

impl RunStatus {
    fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            ..Self::default()
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            cmd: String::new(),
            pid: None,
            complete: false,
            exit: EXIT_UNSET,
            error: None,
            signaled: false,
            start_ts: None,
            stop_ts: None,
            runtime: Duration::ZERO,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Starting,
    Running,
    Done,
}

struct RunState {
    phase: Phase,
    stop_requested: bool,
    finalized: bool,
    started_at: Option<Instant>,
    status: RunStatus,
    stdout_buf: Option<Arc<OutputBuffer>>,
    stderr_buf: Option<Arc<OutputBuffer>>,
    streams: Option<(LineStream, LineStream)>,
}

struct Shared {
    state: Mutex<RunState>,
    done: watch::Sender<Option<RunStatus>>,
}

impl Shared {
    fn snapshot(&self) -> RunStatus {
        let mut state = self.state.lock();

        let phase = state.phase;
        match phase {
            Phase::NotStarted | Phase::Starting => {}
            Phase::Running => {
                if let Some(started_at) = state.started_at {
                    state.status.runtime = started_at.elapsed();
                }
                if let Some(lines) = state.stdout_buf.as_ref().map(|buf| buf.lines()) {
                    state.status.stdout = lines;
                }
                if let Some(lines) = state.stderr_buf.as_ref().map(|buf| buf.lines()) {
                    state.status.stderr = lines;
                }
            }
            Phase::Done if !state.finalized => {
                if let Some(buf) = state.stdout_buf.take() {
                    state.status.stdout = buf.lines();
                }
                if let Some(buf) = state.stderr_buf.take() {
                    state.status.stderr = buf.lines();
                }
                state.finalized = true;
            }
            Phase::Done => {}
        }

        state.status.clone()
    }

    fn publish(&self) {
        let status = self.snapshot();
        self.done.send_replace(Some(status));
    }
}

/// Await the final status of a started command
#[derive(Debug, Clone)]
pub struct RunHandle {
    receiver: watch::Receiver<Option<RunStatus>>,
}

impl RunHandle {
    /// Wait for the process to exit and return its final status
    pub async fn wait(mut self) -> RunStatus {
        if let Ok(status) = self.receiver.wait_for(Option::is_some).await {
            return (*status).clone().unwrap_or_default();
        }
        // The runner task is gone; whatever it published last is final
        let last = self.receiver.borrow().clone();
        last.unwrap_or_default()
    }

    /// The final status, if the process has already exited
    pub fn try_status(&self) -> Option<RunStatus> {
        self.receiver.borrow().clone()
    }
}

/// One external process
pub struct Cmd {
    spec: CommandSpec,
    shared: Arc<Shared>,
    stdout_lines: Mutex<Option<mpsc::Receiver<String>>>,
    stderr_lines: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Cmd {
    /// Configure a command from its description
    pub fn new(spec: CommandSpec) -> Self {
        let buffered = spec.mode.buffers();
        let stdout_buf = buffered.then(OutputBuffer::new);
        let stderr_buf = (buffered && !spec.mode.combines()).then(OutputBuffer::new);

        let (streams, stdout_lines, stderr_lines) = if spec.mode.streams() {
            let (out, out_rx) = LineStream::channel(spec.line_buffer_size, DEFAULT_STREAM_CHAN_SIZE);
            let (err, err_rx) = LineStream::channel(spec.line_buffer_size, DEFAULT_STREAM_CHAN_SIZE);
            (Some((out, err)), Some(out_rx), Some(err_rx))
        } else {
            (None, None, None)
        };

        let (done, _) = watch::channel(None);
        let state = RunState {
            phase: Phase::NotStarted,
            stop_requested: false,
            finalized: false,
            started_at: None,
            status: RunStatus::new(&spec.name),
            stdout_buf,
            stderr_buf,
            streams,
        };

        Self {
            spec,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                done,
            }),
            stdout_lines: Mutex::new(stdout_lines),
            stderr_lines: Mutex::new(stderr_lines),
        }
    }

    /// Configure `name args...` with buffered output
    pub fn buffered<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandSpec::new(name).args(args))
    }

    /// The description this command was configured from
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// A new, unstarted command with the same configuration
    pub fn clone_fresh(&self) -> Self {
        Self::new(self.spec.clone())
    }

    /// Receiver of streamed stdout lines. Available once, only when streaming.
    pub fn take_stdout_lines(&self) -> Option<mpsc::Receiver<String>> {
        self.stdout_lines.lock().take()
    }

    /// Receiver of streamed stderr lines. Available once, only when streaming.
    pub fn take_stderr_lines(&self) -> Option<mpsc::Receiver<String>> {
        self.stderr_lines.lock().take()
    }

    /// Start the process with stdin connected to `/dev/null`
    pub fn start(&self) -> RunHandle {
        self.start_with_stdin(None)
    }

    /// Start the process. Later calls return a handle to the same run.
    pub fn start_with_stdin(&self, stdin: Option<Stdio>) -> RunHandle {
        let mut state = self.shared.state.lock();

        if state.phase == Phase::NotStarted {
            state.phase = Phase::Starting;

            let mut stdout_sink = FanOut::new();
            let mut stderr_sink = FanOut::new();
            if let Some((out, err)) = state.streams.take() {
                stdout_sink.push(out);
                stderr_sink.push(err);
            }
            if let Some(buf) = &state.stdout_buf {
                stdout_sink.push(Arc::clone(buf));
                let stderr_buf = state.stderr_buf.as_ref().unwrap_or(buf);
                stderr_sink.push(Arc::clone(stderr_buf));
            }

            tokio::spawn(run(
                self.spec.clone(),
                Arc::clone(&self.shared),
                stdin,
                stdout_sink,
                stderr_sink,
            ));
        }
        drop(state);

        RunHandle {
            receiver: self.shared.done.subscribe(),
        }
    }

    /// Current snapshot. Finalizes captured output on the first call after
    /// exit and releases the buffers.
    pub fn status(&self) -> RunStatus {
        self.shared.snapshot()
    }

    /// Wait until the process has exited
    pub async fn done(&self) -> RunStatus {
        RunHandle {
            receiver: self.shared.done.subscribe(),
        }
        .wait()
        .await
    }

    /// Send SIGTERM to the whole process group
    pub fn stop(&self) -> Result<(), ProcessError> {
        let mut state = self.shared.state.lock();

        if state.stop_requested {
            return Ok(());
        }
        state.stop_requested = true;

        match state.phase {
            Phase::NotStarted | Phase::Starting => Err(ProcessError::NotStarted),
            Phase::Done => Ok(()),
            Phase::Running => match state.status.pid {
                Some(pid) => terminate_group(pid),
                None => Err(ProcessError::NotStarted),
            },
        }
    }
}

fn terminate_group(pid: u32) -> Result<(), ProcessError> {
    let pgid = pid as libc::pid_t;
    debug!(pgid, "terminating process group");
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(ProcessError::Signal {
            pgid,
            reason: std::io::Error::last_os_error().to_string(),
        })
    }
}

fn pipe_mode(sink: &FanOut) -> Stdio {
    if sink.is_empty() {
        Stdio::null()
    } else {
        Stdio::piped()
    }
}

async fn pump<R>(mut pipe: R, mut sink: FanOut, program: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = sink.write(&chunk[..n]).await {
                    warn!(%program, stream, %err, "line stream rejected chunk");
                }
            }
            Err(err) => {
                warn!(%program, stream, %err, "failed to read process output");
                break;
            }
        }
    }
    if let Err(err) = sink.flush().await {
        debug!(%program, stream, %err, "failed to flush process output");
    }
}

async fn run(
    spec: CommandSpec,
    shared: Arc<Shared>,
    stdin: Option<Stdio>,
    stdout_sink: FanOut,
    stderr_sink: FanOut,
) {
    let mut command = Command::new(&spec.name);
    command
        .args(&spec.args)
        .stdin(stdin.unwrap_or_else(Stdio::null))
        .stdout(pipe_mode(&stdout_sink))
        .stderr(pipe_mode(&stderr_sink))
        .process_group(0);
    if let Some(dir) = &spec.dir {
        command.current_dir(dir);
    }
    if let Some(env) = &spec.env {
        command.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
    }

    let started = Utc::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            debug!(program = %spec.name, %err, "failed to start process");
            {
                let mut state = shared.state.lock();
                state.status.error = Some(ProcessError::Start {
                    program: spec.name.clone(),
                    reason: err.to_string(),
                });
                state.status.start_ts = Some(started);
                state.status.stop_ts = Some(started);
                state.phase = Phase::Done;
            }
            // Dropping the sinks closes the line channels
            drop(stdout_sink);
            drop(stderr_sink);
            shared.publish();
            return;
        }
    };

    let started_at = Instant::now();
    {
        let mut state = shared.state.lock();
        state.status.pid = child.id();
        state.status.start_ts = Some(started);
        state.started_at = Some(started_at);
        state.phase = Phase::Running;
    }
    debug!(program = %spec.name, pid = ?child.id(), "process started");

    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(pump(pipe, stdout_sink, spec.name.clone(), "stdout")));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(pump(pipe, stderr_sink, spec.name.clone(), "stderr")));

    let waited = child.wait().await;
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let _ = task.await;
    }
    let stopped = Utc::now();

    {
        let mut state = shared.state.lock();
        match waited {
            Ok(exit) => {
                let signal = exit.signal();
                state.status.exit = exit.code().unwrap_or(EXIT_UNSET);
                state.status.signaled = signal.is_some();
                state.status.error = signal.map(|signal| ProcessError::Signaled { signal });
                state.status.complete = !state.stop_requested && signal.is_none();
            }
            Err(err) => {
                state.status.error = Some(ProcessError::Wait(err.to_string()));
            }
        }
        state.status.runtime = started_at.elapsed();
        state.status.stop_ts = Some(stopped);
        state.phase = Phase::Done;

        debug!(
            program = %spec.name,
            exit = state.status.exit,
            signaled = state.status.signaled,
            "process exited"
        );
    }

    shared.publish();
}
