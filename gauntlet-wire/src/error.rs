//! Error types for the wire layer.

use crate::codec::MAX_PAYLOAD_SIZE;

/// Result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while building or parsing wire frames.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from the header.
        expected: u32,
        /// Computed checksum from the data.
        actual: u32,
    },

    /// Payload exceeds the protocol's stated maximum.
    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Channel kind byte does not name a known kind.
    #[error("unknown channel kind: {value}")]
    UnknownChannelKind {
        /// The unrecognized kind byte.
        value: u8,
    },

    /// Channel index 0 is reserved for the control channel.
    #[error("channel 0 is reserved for control, got kind {kind:?}")]
    ReservedChannel {
        /// The non-control kind that tried to claim index 0.
        kind: crate::bunch::ChannelKind,
    },

    /// Control message discriminant is not registered.
    #[error("unknown control message: {discriminant}")]
    UnknownControlMessage {
        /// The unrecognized discriminant byte.
        discriminant: u8,
    },

    /// Harness sub-command byte is not registered.
    #[error("unknown harness command: {value}")]
    UnknownHarnessCommand {
        /// The unrecognized command byte.
        value: u8,
    },

    /// A length-prefixed string field was truncated or not valid UTF-8.
    #[error("malformed string field")]
    MalformedString,
}
