//! File-drop IPC transport.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Channel, ChannelError, ChannelKind};
use crate::envelope::{self, Envelope};

/// Interval at which `receive` re-checks the response file.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// File-based IPC channel.
///
/// Outbound envelopes are truncate-written to the base path; inbound
/// envelopes are polled from `<base>.response`, which is consumed (deleted)
/// on read. Both files are removed on close.
///
/// This transport holds a single outbound slot: a `send` overwrites whatever
/// the peer has not yet read. It is only suitable for request-slot traffic
/// where the producer waits for its response before sending again.
pub struct FileIpcChannel {
    outbound: PathBuf,
    inbound: PathBuf,
    write_lock: Mutex<()>,
    read_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileIpcChannel {
    /// Create a channel over `base` and `base.response`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let outbound = base.into();
        let mut inbound = outbound.clone().into_os_string();
        inbound.push(".response");
        Self {
            outbound,
            inbound: PathBuf::from(inbound),
            write_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Path envelopes are written to.
    #[must_use]
    pub fn outbound_path(&self) -> &Path {
        &self.outbound
    }

    /// Path envelopes are read from.
    #[must_use]
    pub fn inbound_path(&self) -> &Path {
        &self.inbound
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for FileIpcChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::FileIpc
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.check_open()?;
        if let Some(parent) = self.outbound.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.check_open()?;
        let bytes = envelope::encode(envelope)?;
        let _guard = self.write_lock.lock().await;
        self.check_open()?;
        tokio::fs::write(&self.outbound, &bytes).await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>, ChannelError> {
        self.check_open()?;
        let _guard = self.read_lock.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check_open()?;
            match tokio::fs::read(&self.inbound).await {
                Ok(bytes) if !bytes.is_empty() => {
                    tokio::fs::remove_file(&self.inbound).await?;
                    return Ok(Some(envelope::decode(&bytes)?));
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = tokio::fs::remove_file(&self.outbound).await;
        let _ = tokio::fs::remove_file(&self.inbound).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;

    fn request() -> Envelope {
        Envelope::new(EnvelopeKind::Command, "sup", "worker", "ping").with_id("m1")
    }

    #[tokio::test]
    async fn test_send_writes_outbound_file() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileIpcChannel::new(dir.path().join("t.json"));
        channel.initialize().await.unwrap();

        channel.send(&request()).await.unwrap();

        let bytes = std::fs::read(channel.outbound_path()).unwrap();
        let decoded = envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.command, "ping");
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileIpcChannel::new(dir.path().join("t.json"));
        channel.initialize().await.unwrap();

        channel.send(&request()).await.unwrap();

        // Simulate the peer dropping its reply into the response slot.
        let reply = Envelope::new(EnvelopeKind::Response, "worker", "sup", "ping")
            .with_payload(r#"{"ok":true}"#)
            .with_id("m2");
        std::fs::write(channel.inbound_path(), envelope::encode(&reply).unwrap()).unwrap();

        let received = channel
            .receive(Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, reply);

        // The response slot is consumed.
        assert!(!channel.inbound_path().exists());
    }

    #[tokio::test]
    async fn test_receive_times_out_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileIpcChannel::new(dir.path().join("t.json"));
        channel.initialize().await.unwrap();

        let got = channel.receive(Duration::from_millis(120)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_close_removes_files_and_rejects_ops() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileIpcChannel::new(dir.path().join("t.json"));
        channel.initialize().await.unwrap();
        channel.send(&request()).await.unwrap();

        channel.close().await;
        assert!(!channel.outbound_path().exists());

        assert!(matches!(
            channel.send(&request()).await,
            Err(ChannelError::Closed)
        ));
        assert!(matches!(
            channel.receive(Duration::from_millis(10)).await,
            Err(ChannelError::Closed)
        ));
    }
}
