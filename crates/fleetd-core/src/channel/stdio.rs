//! Pipe-based stdio transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Channel, ChannelError, ChannelKind};
use crate::envelope::{self, Envelope};

/// Upper bound on one inbound line. Envelope payloads are capped at 1 MiB,
/// so anything past this is a misbehaving peer, not a legitimate frame.
const MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

struct ReadState {
    reader: BufReader<BoxedReader>,
    /// Bytes received ahead of a newline; retained across timed-out
    /// receives so partial lines are never dropped.
    pending: Vec<u8>,
}

/// Stdio channel over a child's standard pipes.
///
/// Created detached at registration; [`StdioChannel::attach`] wires the
/// pipes captured when the child is spawned. Envelopes travel one per line:
/// outbound on the child's stdin, inbound on its stdout. Stderr is drained
/// to the log and never parsed.
pub struct StdioChannel {
    peer: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<ReadState>>,
    closed: AtomicBool,
}

impl StdioChannel {
    /// Create a detached channel for the named peer process.
    #[must_use]
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the parent-side pipe ends of a freshly spawned child.
    ///
    /// Replaces any previously attached endpoints, which makes re-attachment
    /// after a restart safe.
    pub async fn attach(
        &self,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) {
        *self.writer.lock().await = Some(Box::new(stdin));
        *self.reader.lock().await = Some(ReadState {
            reader: BufReader::new(Box::new(stdout) as BoxedReader),
            pending: Vec::new(),
        });
    }

    /// Drain the child's stderr in a background task, logging each line.
    pub fn spawn_stderr_drain(&self, stderr: impl AsyncRead + Send + Unpin + 'static) {
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(process = %peer, "child stderr: {line}");
            }
            debug!(process = %peer, "stderr drain finished");
        });
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Pop one complete line from the pending buffer, skipping blanks.
    fn take_line(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if line.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(line);
            }
        }
        None
    }
}

#[async_trait]
impl Channel for StdioChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Stdio
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        // Pipe creation happens at spawn time; nothing to acquire here.
        self.check_open()
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.check_open()?;
        let bytes = envelope::encode(envelope)?;
        let mut guard = self.writer.lock().await;
        self.check_open()?;
        let writer = guard.as_mut().ok_or(ChannelError::NotAttached)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>, ChannelError> {
        self.check_open()?;
        let mut guard = self.reader.lock().await;
        let state = guard.as_mut().ok_or(ChannelError::NotAttached)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(line) = Self::take_line(&mut state.pending) {
                return Ok(Some(envelope::decode(&line)?));
            }
            if state.pending.len() > MAX_LINE_BYTES {
                return Err(ChannelError::FrameTooLarge(MAX_LINE_BYTES));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // fill_buf is cancel-safe: nothing is consumed until consume(),
            // so a timeout here cannot lose bytes.
            match tokio::time::timeout(deadline - now, state.reader.fill_buf()).await {
                Err(_) => return Ok(None),
                Ok(Ok(chunk)) => {
                    if chunk.is_empty() {
                        // EOF: the child closed its stdout (likely exited).
                        return Ok(None);
                    }
                    let taken = chunk.len();
                    state.pending.extend_from_slice(chunk);
                    state.reader.consume(taken);
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the writer closes the child's stdin, signalling EOF.
        self.writer.lock().await.take();
        self.reader.lock().await.take();
    }
}
