//! Binary frame codec for the sync wire protocol.
//!
//! Wire format:
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ type tag         │ payload                  │
//! │ varint, 1–10 B   │ variable, handler-owned  │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! The type tag is an unsigned varint: seven value bits per byte,
//! least-significant group first, high bit set on every byte except the
//! last. The payload is opaque to this layer — its format belongs to
//! whichever handler the tag routes to.
//!
//! Decoding a frame never inspects the payload and never rejects an
//! unassigned tag; "no handler for this tag" is a dispatch condition,
//! not a codec error. The codec is stateless and safe to call from any
//! number of connections concurrently.
//!
//! Reference: Patterson & Hennessy, Section 2.12 — variable-length encodings

/// Maximum number of bytes a `u64` varint may occupy.
pub const MAX_VARINT_LEN: usize = 10;

/// Message types for the sync protocol.
///
/// The tag values are wire format — changing them breaks every deployed
/// client. Tags with no variant here are reserved for protocol
/// evolution; frames carrying them decode fine and are dropped by the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application-level keepalive probe
    Ping = 0,
    /// Keepalive answer
    Pong = 1,
    /// State vector offer opening a sync handshake
    SyncStep1 = 2,
    /// State diff answering a sync-step-1
    SyncStep2 = 3,
    /// Incremental CRDT update
    Update = 4,
    /// Cursor/selection awareness update
    Awareness = 5,
}

impl MessageType {
    /// Wire tag for this message type.
    pub fn tag(self) -> u64 {
        self as u64
    }

    /// Map a decoded wire tag back to its message type.
    ///
    /// `None` for well-formed but unassigned tags.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Ping),
            1 => Some(Self::Pong),
            2 => Some(Self::SyncStep1),
            3 => Some(Self::SyncStep2),
            4 => Some(Self::Update),
            5 => Some(Self::Awareness),
            _ => None,
        }
    }

    /// Canonical name, the key handlers are registered under.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::SyncStep1 => "sync-step-1",
            Self::SyncStep2 => "sync-step-2",
            Self::Update => "update",
            Self::Awareness => "awareness",
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame failed to decode: empty buffer, or a truncated/overlong
    /// leading varint.
    MalformedFrame(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame(reason) => write!(f, "malformed frame: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Append `value` to `buf` as an unsigned varint.
pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned varint from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed. Fails on an empty
/// buffer, on input ending with the continuation bit still set, and on
/// encodings longer than a `u64` can carry.
pub fn read_var_u64(bytes: &[u8]) -> Result<(u64, usize), ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::MalformedFrame("empty buffer"));
    }

    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(ProtocolError::MalformedFrame("overlong varint"));
        }
        let bits = (byte & 0x7F) as u64;
        // The tenth byte holds bit 63 and nothing else.
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(ProtocolError::MalformedFrame("overlong varint"));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::MalformedFrame("truncated varint"))
}

/// Encode one frame: varint `tag` followed by `payload` verbatim.
pub fn encode_frame(tag: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN + payload.len());
    write_var_u64(&mut buf, tag);
    buf.extend_from_slice(payload);
    buf
}

/// Decode one frame into its tag and payload cursor.
///
/// Left inverse of [`encode_frame`]:
/// `decode_frame(&encode_frame(t, p)) == Ok((t, p))` for every tag and
/// payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(u64, &[u8]), ProtocolError> {
    let (tag, consumed) = read_var_u64(bytes)?;
    Ok((tag, &bytes[consumed..]))
}
