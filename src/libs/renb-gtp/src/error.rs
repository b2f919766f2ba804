//! GTP-U error types

use thiserror::Error;

/// GTP-U codec error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GtpError {
    /// Buffer too short for operation
    #[error("Buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Invalid version
    #[error("Invalid GTP version: {0}")]
    InvalidVersion(u8),

    /// Protocol-type bit names GTP' rather than GTP
    #[error("Protocol type is not GTP")]
    InvalidProtocolType,

    /// Invalid message type
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Extension header with a zero length field
    #[error("Zero-length extension header (type {0:#04x})")]
    ZeroExtensionLength(u8),

    /// Extension content that cannot be framed in 4-byte units
    #[error("Invalid extension content length: {len}")]
    InvalidExtensionContent { len: usize },
}

/// GTP-U Result type
pub type GtpResult<T> = Result<T, GtpError>;
