//! Message envelope module.
//!
//! Defines the envelope exchanged between the supervisor and its child
//! processes, the newline-framed JSON wire codec, and the structural
//! validator applied to every inbound envelope.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Maximum accepted payload size: 1 MiB. A payload of exactly this many
/// bytes is accepted; one byte more is rejected.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Envelope kind.
///
/// The numeric ordinal of each kind is part of the wire contract
/// (`Command = 0` through `Error = 5`) and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// A request for the target to perform an action.
    Command,
    /// A reply to a previously received command.
    Response,
    /// An unsolicited notification.
    Event,
    /// A liveness beacon; refreshes the sender's heartbeat clock.
    Heartbeat,
    /// A request for the target to exit gracefully.
    Shutdown,
    /// An error report.
    Error,
}

impl EnvelopeKind {
    /// Wire ordinal of this kind.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Command => 0,
            Self::Response => 1,
            Self::Event => 2,
            Self::Heartbeat => 3,
            Self::Shutdown => 4,
            Self::Error => 5,
        }
    }

    /// Look up a kind by its wire ordinal.
    #[must_use]
    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Command),
            1 => Some(Self::Response),
            2 => Some(Self::Event),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Shutdown),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Response => write!(f, "response"),
            Self::Event => write!(f, "event"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single structured message exchanged over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message kind.
    pub kind: EnvelopeKind,
    /// Logical name of the sending process.
    pub source: String,
    /// Logical name of the recipient; `"*"` denotes broadcast.
    pub target: String,
    /// Verb used as the router key.
    pub command: String,
    /// Opaque JSON text, at most [`MAX_PAYLOAD_BYTES`].
    pub payload: String,
    /// Producer-assigned monotonic timestamp.
    pub timestamp: u64,
    /// Producer-unique message identifier.
    pub id: String,
}

impl Envelope {
    /// Create an envelope with an empty (`"{}"`) payload.
    #[must_use]
    pub fn new(
        kind: EnvelopeKind,
        source: impl Into<String>,
        target: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
            command: command.into(),
            payload: "{}".to_string(),
            timestamp: 0,
            id: String::new(),
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the producer timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the message identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// On-the-wire representation. Field names and the integer `type` ordinal
/// are fixed by the wire contract.
#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: u8,
    source: &'a str,
    target: &'a str,
    command: &'a str,
    data: &'a RawValue,
    timestamp: u64,
    message_id: &'a str,
}

#[derive(Deserialize)]
struct WireIn<'a> {
    #[serde(rename = "type")]
    kind: u8,
    source: String,
    target: String,
    command: String,
    #[serde(borrow)]
    data: &'a RawValue,
    timestamp: u64,
    message_id: String,
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The `type` field carried an ordinal outside the wire mapping.
    #[error("unknown envelope kind ordinal {0}")]
    UnknownKind(u8),

    /// The bytes were not a well-formed wire envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode an envelope as newline-terminated JSON.
///
/// The payload is inlined as a raw JSON value, so an envelope that decodes
/// and re-encodes reproduces the payload text byte for byte.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the payload is not valid JSON.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let data: &RawValue = serde_json::from_str(&envelope.payload)?;
    let wire = WireOut {
        kind: envelope.kind.ordinal(),
        source: &envelope.source,
        target: &envelope.target,
        command: &envelope.command,
        data,
        timestamp: envelope.timestamp,
        message_id: &envelope.id,
    };
    let mut bytes = serde_json::to_vec(&wire)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one wire envelope from a (possibly newline-terminated) frame.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for syntactically invalid frames and
/// [`CodecError::UnknownKind`] for an out-of-range `type` ordinal.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let wire: WireIn<'_> = serde_json::from_slice(trim_frame(bytes))?;
    let kind = EnvelopeKind::from_ordinal(wire.kind).ok_or(CodecError::UnknownKind(wire.kind))?;
    Ok(Envelope {
        kind,
        source: wire.source,
        target: wire.target,
        command: wire.command,
        payload: wire.data.get().to_string(),
        timestamp: wire.timestamp,
        id: wire.message_id,
    })
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    let mut frame = bytes;
    while let [rest @ .., last] = frame {
        if last.is_ascii_whitespace() {
            frame = rest;
        } else {
            break;
        }
    }
    frame
}

/// Validation errors, in check-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// `source` is the empty string.
    #[error("Source process is empty")]
    EmptySource,

    /// `target` is the empty string.
    #[error("Target process is empty")]
    EmptyTarget,

    /// `command` is the empty string.
    #[error("Command is empty")]
    EmptyCommand,

    /// The payload exceeds [`MAX_PAYLOAD_BYTES`].
    #[error("Payload exceeds 1 MiB limit")]
    PayloadTooLarge,

    /// The payload is not valid JSON.
    #[error("Payload is not valid JSON")]
    PayloadNotJson,
}

/// Validate the structural constraints on an envelope.
///
/// Checks run in a fixed priority order: empty source, empty target, empty
/// command, oversized payload, non-JSON payload. The first failing check
/// wins.
///
/// # Errors
///
/// Returns the highest-priority [`ValidationError`] that applies.
pub fn validate(envelope: &Envelope) -> Result<(), ValidationError> {
    if envelope.source.is_empty() {
        return Err(ValidationError::EmptySource);
    }
    if envelope.target.is_empty() {
        return Err(ValidationError::EmptyTarget);
    }
    if envelope.command.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    if envelope.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge);
    }
    if serde_json::from_str::<&RawValue>(&envelope.payload).is_err() {
        return Err(ValidationError::PayloadNotJson);
    }
    Ok(())
}

/// Width of the rolling rate-limit window.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Per-source message rate limiter.
///
/// An unconfigured limiter is the reserved noop hook: every check passes.
/// With a limit of `n`, at most `n` messages per source are admitted within
/// any rolling one-second window: each source keeps the timestamps of its
/// admitted messages, entries older than the window are evicted, and a
/// message is admitted only while fewer than `n` remain.
#[derive(Debug, Default)]
pub struct RateLimiter {
    max_per_second: Option<u32>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create the always-pass limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a limiter admitting at most `max_per_second` messages per
    /// source per second.
    #[must_use]
    pub fn with_limit(max_per_second: u32) -> Self {
        Self {
            max_per_second: Some(max_per_second),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check (and account for) one message from `source`.
    pub fn check(&self, source: &str) -> bool {
        let Some(limit) = self.max_per_second else {
            return true;
        };
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let window = windows.entry(source.to_string()).or_default();
        while window
            .front()
            .is_some_and(|&admitted| now.duration_since(admitted) >= RATE_WINDOW)
        {
            window.pop_front();
        }
        if window.len() >= limit as usize {
            return false;
        }
        window.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(EnvelopeKind::Command, "test", "target", "execute")
            .with_payload(r#"{"action": "test"}"#)
            .with_timestamp(123_456_789)
            .with_id("msg-001")
    }

    #[test]
    fn test_ordinal_mapping_is_stable() {
        assert_eq!(EnvelopeKind::Command.ordinal(), 0);
        assert_eq!(EnvelopeKind::Response.ordinal(), 1);
        assert_eq!(EnvelopeKind::Event.ordinal(), 2);
        assert_eq!(EnvelopeKind::Heartbeat.ordinal(), 3);
        assert_eq!(EnvelopeKind::Shutdown.ordinal(), 4);
        assert_eq!(EnvelopeKind::Error.ordinal(), 5);

        for ordinal in 0..=5 {
            let kind = EnvelopeKind::from_ordinal(ordinal).unwrap();
            assert_eq!(kind.ordinal(), ordinal);
        }
        assert_eq!(EnvelopeKind::from_ordinal(6), None);
    }

    #[test]
    fn test_encode_wire_fields() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""type":0"#));
        assert!(text.contains(r#""source":"test""#));
        assert!(text.contains(r#""command":"execute""#));
        assert!(text.contains(r#""data":{"action": "test"}"#));
        assert!(text.contains(r#""message_id":"msg-001""#));
    }

    #[test]
    fn test_round_trip_preserves_payload_text() {
        let envelope = sample().with_payload(r#"{ "spaced" : [1, 2,  3] }"#);
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_full_frame() {
        let frame = br#"{"type":3,"source":"worker","target":"sup","command":"heartbeat","data":{},"timestamp":42,"message_id":"hb-1"}"#;
        let envelope = decode(frame).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Heartbeat);
        assert_eq!(envelope.source, "worker");
        assert_eq!(envelope.payload, "{}");
        assert_eq!(envelope.timestamp, 42);
    }

    #[test]
    fn test_decode_rejects_unknown_ordinal() {
        let frame = br#"{"type":9,"source":"a","target":"b","command":"c","data":{},"timestamp":0,"message_id":"m"}"#;
        assert!(matches!(decode(frame), Err(CodecError::UnknownKind(9))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not json at all"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_validation_priority_order() {
        let mut envelope = sample();
        envelope.source = String::new();
        envelope.target = String::new();
        envelope.command = String::new();
        assert_eq!(validate(&envelope), Err(ValidationError::EmptySource));

        envelope.source = "source".to_string();
        assert_eq!(validate(&envelope), Err(ValidationError::EmptyTarget));

        envelope.target = "target".to_string();
        assert_eq!(validate(&envelope), Err(ValidationError::EmptyCommand));
        assert_eq!(
            validate(&envelope).unwrap_err().to_string(),
            "Command is empty"
        );
    }

    #[test]
    fn test_payload_size_boundary() {
        // A JSON string of exactly 1 MiB: two quotes plus the fill.
        let fill = "a".repeat(MAX_PAYLOAD_BYTES - 2);
        let envelope = sample().with_payload(format!("\"{fill}\""));
        assert_eq!(envelope.payload.len(), MAX_PAYLOAD_BYTES);
        assert_eq!(validate(&envelope), Ok(()));

        let envelope = sample().with_payload(format!("\"{fill}a\""));
        assert_eq!(envelope.payload.len(), MAX_PAYLOAD_BYTES + 1);
        assert_eq!(validate(&envelope), Err(ValidationError::PayloadTooLarge));
    }

    #[test]
    fn test_payload_must_be_json() {
        let envelope = sample().with_payload("not json");
        assert_eq!(validate(&envelope), Err(ValidationError::PayloadNotJson));

        let envelope = sample().with_payload("{}");
        assert_eq!(validate(&envelope), Ok(()));
    }

    #[test]
    fn test_rate_limiter_unconfigured_always_passes() {
        let limiter = RateLimiter::new();
        for _ in 0..10_000 {
            assert!(limiter.check("chatty"));
        }
    }

    #[test]
    fn test_rate_limiter_enforces_per_source_budget() {
        let limiter = RateLimiter::with_limit(3);
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        // Budgets are per source.
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_rate_limiter_window_slides_rather_than_tumbles() {
        let limiter = RateLimiter::with_limit(3);

        // One message early, two late in the first second.
        assert!(limiter.check("a"));
        std::thread::sleep(Duration::from_millis(700));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));

        // Just past one second from the first message: that entry has aged
        // out of the rolling window, but the two late ones have not. A
        // fixed one-second bucket would reset here and admit a full burst.
        std::thread::sleep(Duration::from_millis(450));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(!limiter.check("a"));
    }
}
