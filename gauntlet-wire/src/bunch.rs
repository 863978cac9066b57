//! Bunch data model.
//!
//! A bunch is a reliable or unreliable packet fragment addressed to one
//! logical channel of a connection. Bunches are owned by the channel that
//! created them until handed to the connection for transmission; reliable
//! bunches stay in the channel's pending-ack list until acknowledged.

use crate::error::WireError;

/// Channel index reserved for the control channel.
pub const CONTROL_CHANNEL: u16 = 0;

/// The kind of logical channel a bunch is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Control channel: handshake and out-of-band commands. Index 0 only.
    Control,
    /// Actor replication channel.
    Actor,
    /// Voice data channel.
    Voice,
}

impl ChannelKind {
    /// Wire byte for this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            ChannelKind::Control => 0,
            ChannelKind::Actor => 1,
            ChannelKind::Voice => 2,
        }
    }

    /// Parse a wire byte into a kind.
    ///
    /// # Errors
    ///
    /// Returns `UnknownChannelKind` for unregistered bytes.
    pub fn from_byte(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ChannelKind::Control),
            1 => Ok(ChannelKind::Actor),
            2 => Ok(ChannelKind::Voice),
            other => Err(WireError::UnknownChannelKind { value: other }),
        }
    }
}

/// An outbound or inbound packet fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bunch {
    /// Index of the channel this bunch belongs to.
    pub channel: u16,
    /// Kind of the target channel.
    pub kind: ChannelKind,
    /// Per-channel sequence number.
    pub seq: u32,
    /// Whether the bunch must be retained until acknowledged.
    pub reliable: bool,
    /// Whether this bunch opens its channel.
    pub open: bool,
    /// Whether this bunch closes its channel.
    pub close: bool,
    /// Raw bit payload.
    pub payload: Vec<u8>,
}

impl Bunch {
    /// Create a bunch addressed to `channel`.
    ///
    /// # Errors
    ///
    /// Returns `ReservedChannel` when a non-control kind claims index 0.
    pub fn new(channel: u16, kind: ChannelKind, seq: u32, payload: Vec<u8>) -> Result<Self, WireError> {
        if channel == CONTROL_CHANNEL && kind != ChannelKind::Control {
            return Err(WireError::ReservedChannel { kind });
        }

        Ok(Self {
            channel,
            kind,
            seq,
            reliable: false,
            open: false,
            close: false,
            payload,
        })
    }

    /// Mark the bunch reliable.
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// Mark the bunch as its channel's open bunch.
    pub fn opening(mut self) -> Self {
        self.open = true;
        self
    }

    /// Mark the bunch as its channel's close bunch.
    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
