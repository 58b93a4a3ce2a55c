//! Output collectors for external processes.
//!
//! Two sinks turn raw process output into lines:
//!
//! - [`OutputBuffer`] keeps every byte and splits into lines only when asked.
//! - [`LineStream`] splits eagerly and hands each completed line to a bounded
//!   channel, keeping only the unterminated remainder in a fixed window.
//!
//! Both implement [`OutputSink`], and [`FanOut`] lets one pipe feed several of
//! them at once. Every sink keeps its own partial-line state.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default size of the [`LineStream`] assembly window (bytes).
pub const DEFAULT_LINE_BUFFER_SIZE: usize = 16384;

/// Default capacity of the channel a [`LineStream`] emits onto (lines).
pub const DEFAULT_STREAM_CHAN_SIZE: usize = 1000;

/// Errors raised by output sinks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutputError {
    /// An unterminated line would not fit into the assembly window
    #[error("line does not contain newline and is {excess} bytes too long to buffer (buffer size: {buffer_size})")]
    LineOverflow {
        /// The partial line that did not fit (pending bytes plus the rejected write)
        line: String,
        /// Number of bytes beyond the window size
        excess: usize,
        /// Configured window size
        buffer_size: usize,
    },

    /// The consumer of a line stream has gone away
    #[error("line consumer has gone away")]
    Closed,
}

/// A byte sink fed from a process pipe.
#[async_trait]
pub trait OutputSink: Send {
    /// Accept a chunk of output. Returns the number of bytes accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize, OutputError>;

    /// Called once the pipe reached end of stream.
    async fn flush(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug, Default)]
struct BufferState {
    pending: Vec<u8>,
    lines: Vec<String>,
}

/// Append-only byte buffer with lazy line splitting.
///
/// Writers and readers may race freely; each call takes the internal lock
/// once. Lines are split only when [`OutputBuffer::lines`] is called, and a
/// trailing unterminated line is reported without being committed so later
/// bytes still join it.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    state: Mutex<BufferState>,
}

impl OutputBuffer {
    /// Create an empty buffer, ready to be shared between pipes
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append raw bytes
    pub fn append(&self, data: &[u8]) {
        self.state.lock().pending.extend_from_slice(data);
    }

    /// All lines written so far, CR-trimmed
    pub fn lines(&self) -> Vec<String> {
        let mut state = self.state.lock();

        if let Some(last) = state.pending.iter().rposition(|&b| b == b'\n') {
            let rest = state.pending.split_off(last + 1);
            let complete = std::mem::replace(&mut state.pending, rest);
            let body = &complete[..complete.len() - 1];
            let split: Vec<String> = body.split(|&b| b == b'\n').map(decode_line).collect();
            state.lines.extend(split);
        }

        let mut lines = state.lines.clone();
        if !state.pending.is_empty() {
            lines.push(decode_line(&state.pending));
        }
        lines
    }
}

#[async_trait]
impl OutputSink for Arc<OutputBuffer> {
    async fn write(&mut self, data: &[u8]) -> Result<usize, OutputError> {
        self.append(data);
        Ok(data.len())
    }
}

/// Streaming line splitter.
///
/// Completed lines are sent on a bounded channel as soon as their terminator
/// arrives; a full channel applies backpressure to the writer. Only the
/// unterminated remainder is retained, and it may never grow beyond the
/// window size.
#[derive(Debug)]
pub struct LineStream {
    sender: mpsc::Sender<String>,
    window: Vec<u8>,
    buffer_size: usize,
}

impl LineStream {
    /// Wrap an existing sender with the default window size
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            sender,
            window: Vec::with_capacity(DEFAULT_LINE_BUFFER_SIZE),
            buffer_size: DEFAULT_LINE_BUFFER_SIZE,
        }
    }

    /// Create a stream together with the receiving end of its channel
    pub fn channel(buffer_size: usize, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender).with_buffer_size(buffer_size), receiver)
    }

    /// Replace the window size. Any pending partial line is discarded.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self.window = Vec::with_capacity(self.buffer_size);
        self
    }

    /// Configured window size
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes of the current unterminated line
    pub fn pending(&self) -> usize {
        self.window.len()
    }

    async fn emit(&self, line: String) -> Result<(), OutputError> {
        self.sender.send(line).await.map_err(|_| OutputError::Closed)
    }
}

#[async_trait]
impl OutputSink for LineStream {
    async fn write(&mut self, data: &[u8]) -> Result<usize, OutputError> {
        let last_newline = data.iter().rposition(|&b| b == b'\n');
        let tail = match last_newline {
            Some(pos) => &data[pos + 1..],
            None => data,
        };

        // The window is consumed by the first line when this write terminates it.
        let carried = if last_newline.is_some() { 0 } else { self.window.len() };
        if carried + tail.len() > self.buffer_size {
            let mut line = Vec::with_capacity(carried + tail.len());
            line.extend_from_slice(&self.window[..carried]);
            line.extend_from_slice(tail);
            return Err(OutputError::LineOverflow {
                excess: line.len() - self.buffer_size,
                line: String::from_utf8_lossy(&line).into_owned(),
                buffer_size: self.buffer_size,
            });
        }

        if let Some(pos) = last_newline {
            let mut segments = data[..pos].split(|&b| b == b'\n');
            if let Some(first) = segments.next() {
                let mut head = std::mem::take(&mut self.window);
                head.extend_from_slice(first);
                self.emit(decode_line(&head)).await?;
                head.clear();
                self.window = head;
            }
            for segment in segments {
                self.emit(decode_line(segment)).await?;
            }
        }

        self.window.extend_from_slice(tail);
        Ok(data.len())
    }

    async fn flush(&mut self) -> Result<(), OutputError> {
        if self.window.is_empty() {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&self.window).into_owned();
        self.window.clear();
        self.emit(line).await
    }
}

/// Writes every chunk to all of its sinks.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn OutputSink>>,
}

impl FanOut {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn push(&mut self, sink: impl OutputSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    /// Whether no sink is attached
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Number of attached sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl OutputSink for FanOut {
    async fn write(&mut self, data: &[u8]) -> Result<usize, OutputError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.write(data).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(data.len()),
        }
    }

    async fn flush(&mut self) -> Result<(), OutputError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
