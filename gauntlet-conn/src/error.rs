//! Error types for the fake client connection.

use gauntlet_wire::WireError;

/// Result alias for connection operations.
pub type ConnResult<T> = Result<T, ConnError>;

/// Errors that can occur while driving the fake client.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// A flag combination violates the harness dependency rules.
    #[error("invalid flag combination: {rule}")]
    InvalidFlags {
        /// The violated rule, human readable.
        rule: &'static str,
    },

    /// Operation requires a live connection.
    #[error("not connected")]
    NotConnected,

    /// The control channel is absent from the slot table.
    #[error("control channel missing")]
    ControlChannelMissing,

    /// Channel index is outside the slot table.
    #[error("channel index {index} out of range (max {max})")]
    ChannelOutOfRange {
        /// The offending index.
        index: u16,
        /// Highest allowed index.
        max: u16,
    },

    /// A channel already occupies the requested slot.
    #[error("channel slot {index} already open")]
    ChannelSlotBusy {
        /// The occupied index.
        index: u16,
    },

    /// The underlying transport has been closed.
    #[error("transport closed")]
    TransportClosed,

    /// Wire-level failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
