//! Error types for the close-frame codec.

use thiserror::Error;

/// Why a close frame could not be built or parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseFrameError {
    /// Status code outside the 1000–4999 range.
    #[error("close code {0} is outside 1000-4999")]
    CodeOutOfRange(u16),
    /// 1010 is only meaningful when sent by a client.
    #[error("close code 1010 (mandatory extension) cannot be sent by a server")]
    MandatoryExtension,
    /// 1005 means "no status" and has no room for a reason.
    #[error("close code 1005 (no status) cannot carry a reason")]
    ReasonWithNoStatus,
    /// Reason longer than a control frame allows.
    #[error("close reason is {0} bytes, the limit is 123")]
    ReasonTooLong(usize),
    /// A payload of exactly one byte.
    #[error("close payload is truncated")]
    Truncated,
    /// Reason bytes are not UTF-8.
    #[error("close reason is not valid UTF-8")]
    InvalidUtf8,
}
