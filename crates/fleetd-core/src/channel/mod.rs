//! Inter-process communication channels.
//!
//! A [`Channel`] is an instantiated transport bound to one child process.
//! Two transports are provided: [`FileIpcChannel`] (whole-file JSON drop)
//! and [`StdioChannel`] (newline-framed envelopes over the child's standard
//! pipes).

mod file;
mod stdio;

use std::time::Duration;

use async_trait::async_trait;
pub use file::FileIpcChannel;
use serde::{Deserialize, Serialize};
pub use stdio::StdioChannel;

use crate::envelope::Envelope;

/// Transport kind behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// JSON file-based IPC.
    FileIpc,
    /// Standard input/output pipes.
    Stdio,
    /// Named pipe / Unix domain socket. Enumerated for the wire contract;
    /// no transport is currently instantiable under this kind.
    NamedPipe,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileIpc => write!(f, "file_ipc"),
            Self::Stdio => write!(f, "stdio"),
            Self::NamedPipe => write!(f, "named_pipe"),
        }
    }
}

/// Channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel has been closed; no further operations are possible.
    #[error("channel is closed")]
    Closed,

    /// The channel has not been attached to a child's pipes yet.
    #[error("channel is not attached to a child process")]
    NotAttached,

    /// An inbound frame grew past the per-line limit without a newline.
    #[error("inbound frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not decode as an envelope.
    #[error("codec error: {0}")]
    Codec(#[from] crate::envelope::CodecError),
}

/// Abstract bidirectional envelope transport.
///
/// Concurrent operations on one channel are serialized internally; callers
/// may share a channel behind an `Arc` freely. After [`Channel::close`],
/// every operation fails with [`ChannelError::Closed`].
#[async_trait]
pub trait Channel: Send + Sync {
    /// The transport kind of this channel.
    fn kind(&self) -> ChannelKind;

    /// Acquire OS resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if resources cannot be acquired.
    async fn initialize(&self) -> Result<(), ChannelError>;

    /// Serialize and deliver one envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the envelope cannot be delivered.
    async fn send(&self, envelope: &Envelope) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for one envelope.
    ///
    /// Returns `Ok(None)` on timeout, with no partial effect.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] on transport or decode failure.
    async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>, ChannelError>;

    /// Release resources. Subsequent operations fail with
    /// [`ChannelError::Closed`].
    async fn close(&self);
}
