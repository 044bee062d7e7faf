//! Close status codes and the close-frame codec (RFC 6455 §5.5.1, §7.4).
//!
//! A close frame payload is either empty or a 2-byte big-endian status code
//! followed by an optional UTF-8 reason. Control frames carry at most 125
//! payload bytes, which leaves [`MAX_REASON_BYTES`] for the reason.
//!
//! [`CloseFrame::new`] validates everything a server is allowed to emit
//! before encoding, and keeps the encoded payload as shared [`Bytes`] so one
//! frame can be reused to close many sessions.
//!
//! Codes 1004, 1006 and 1015 are reserved for local reporting. A frame with
//! one of them can be constructed (it is how an abnormal teardown is
//! requested) but [`CloseFrame::is_sendable`] is false and transports tear
//! the connection down without writing it.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::CloseFrameError;

/// Maximum reason length: 125-byte control payload minus the 2-byte code.
pub const MAX_REASON_BYTES: usize = 123;

/// WebSocket close status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCode(u16);

impl CloseCode {
    /// 1000: normal closure.
    pub const NORMAL: Self = Self(1000);
    /// 1001: endpoint going away.
    pub const AWAY: Self = Self(1001);
    /// 1002: protocol error.
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// 1003: unsupported data type.
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// 1004: reserved.
    pub const UNDEFINED: Self = Self(1004);
    /// 1005: no status code present.
    pub const NO_STATUS: Self = Self(1005);
    /// 1006: connection dropped without a close frame.
    pub const ABNORMAL: Self = Self(1006);
    /// 1007: payload inconsistent with message type.
    pub const INVALID_DATA: Self = Self(1007);
    /// 1008: policy violation.
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// 1009: message too big.
    pub const TOO_BIG: Self = Self(1009);
    /// 1010: client expected an extension the server did not negotiate.
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    /// 1011: unexpected server condition.
    pub const SERVER_ERROR: Self = Self(1011);
    /// 1015: TLS handshake failure.
    pub const TLS_HANDSHAKE_FAILURE: Self = Self(1015);

    /// Wrap a raw value without validation.
    pub const fn from_u16(code: u16) -> Self {
        Self(code)
    }

    /// Raw status value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Inside the 1000–4999 range.
    pub fn is_in_range(self) -> bool {
        (1000..=4999).contains(&self.0)
    }

    /// Reserved for local reporting, never written to the wire.
    pub fn is_reserved(self) -> bool {
        matches!(self.0, 1004 | 1006 | 1015)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated close frame with its encoded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    code: CloseCode,
    payload: Bytes,
}

impl CloseFrame {
    /// Build a frame a server may emit.
    ///
    /// # Errors
    ///
    /// - [`CloseFrameError::CodeOutOfRange`] outside 1000–4999
    /// - [`CloseFrameError::MandatoryExtension`] for 1010
    /// - [`CloseFrameError::ReasonWithNoStatus`] for 1005 with a reason
    /// - [`CloseFrameError::ReasonTooLong`] for reasons over 123 bytes
    pub fn new(code: impl Into<CloseCode>, reason: &str) -> Result<Self, CloseFrameError> {
        let code = code.into();
        if !code.is_in_range() {
            return Err(CloseFrameError::CodeOutOfRange(code.as_u16()));
        }
        if code == CloseCode::MANDATORY_EXTENSION {
            return Err(CloseFrameError::MandatoryExtension);
        }
        if code == CloseCode::NO_STATUS {
            if !reason.is_empty() {
                return Err(CloseFrameError::ReasonWithNoStatus);
            }
            return Ok(Self::no_status());
        }
        if reason.len() > MAX_REASON_BYTES {
            return Err(CloseFrameError::ReasonTooLong(reason.len()));
        }
        Ok(Self {
            code,
            payload: encode(code, reason),
        })
    }

    /// 1000 with no reason.
    pub fn normal() -> Self {
        Self::from_parts(CloseCode::NORMAL, "")
    }

    /// 1001 "going away".
    pub fn going_away() -> Self {
        Self::from_parts(CloseCode::AWAY, "going away")
    }

    /// 1006: tear down without a close handshake.
    pub fn abnormal() -> Self {
        Self::from_parts(CloseCode::ABNORMAL, "")
    }

    /// 1005: empty close payload.
    pub fn no_status() -> Self {
        Self {
            code: CloseCode::NO_STATUS,
            payload: Bytes::new(),
        }
    }

    /// Parse a payload received from a peer.
    ///
    /// An empty payload means "no status" (1005).
    pub fn decode(payload: &[u8]) -> Result<Self, CloseFrameError> {
        match payload {
            [] => Ok(Self::no_status()),
            [_] => Err(CloseFrameError::Truncated),
            [hi, lo, rest @ ..] => {
                let code = CloseCode(u16::from_be_bytes([*hi, *lo]));
                if !code.is_in_range() {
                    return Err(CloseFrameError::CodeOutOfRange(code.as_u16()));
                }
                if rest.len() > MAX_REASON_BYTES {
                    return Err(CloseFrameError::ReasonTooLong(rest.len()));
                }
                let reason = std::str::from_utf8(rest).map_err(|_| CloseFrameError::InvalidUtf8)?;
                Ok(Self::from_parts(code, reason))
            }
        }
    }

    /// Frame reported by a peer whose code and reason were already parsed.
    ///
    /// Unlike [`Self::new`] this accepts any code, since peers may legally
    /// send codes a server must not (e.g. 1010).
    pub fn received(code: u16, reason: &str) -> Self {
        let code = CloseCode(code);
        if code == CloseCode::NO_STATUS {
            return Self::no_status();
        }
        Self::from_parts(code, truncate_reason(reason))
    }

    fn from_parts(code: CloseCode, reason: &str) -> Self {
        Self {
            code,
            payload: encode(code, reason),
        }
    }

    /// Status code.
    pub fn code(&self) -> CloseCode {
        self.code
    }

    /// Reason text (empty when absent).
    pub fn reason(&self) -> &str {
        self.payload
            .get(2..)
            .and_then(|r| std::str::from_utf8(r).ok())
            .unwrap_or_default()
    }

    /// Encoded wire payload, shared between every session closed with it.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the frame is written to the peer before closing.
    pub fn is_sendable(&self) -> bool {
        !self.code.is_reserved()
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = self.reason();
        if reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({reason})", self.code)
        }
    }
}

fn encode(code: CloseCode, reason: &str) -> Bytes {
    let mut buf = Vec::with_capacity(2 + reason.len());
    buf.extend_from_slice(&code.as_u16().to_be_bytes());
    buf.extend_from_slice(reason.as_bytes());
    Bytes::from(buf)
}

/// Cut `reason` to at most [`MAX_REASON_BYTES`] on a char boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
