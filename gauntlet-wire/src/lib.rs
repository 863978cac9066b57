//! # Gauntlet Wire Layer
//!
//! Manual construction of the bunch protocol: length-prefixed,
//! sequence-numbered, partially-reliable packet fragments addressed to
//! logical channels within one connection.
//!
//! This crate deliberately bypasses any full protocol handshake. Probes
//! hand-build bunches, track their own sequence numbers and ack state in a
//! [`ShadowChannel`], and push raw frames at a server to see what breaks.
//!
//! Channel index 0 is reserved for the control channel; everything else is
//! an actor or voice channel.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Bunch data model and channel kinds.
pub mod bunch;
/// Shadow channel sequence/ack bookkeeping.
pub mod channel;
/// Frame codec for the wire format.
pub mod codec;
/// Control channel messages and the multiplexed harness command.
pub mod control;
/// Error types for wire operations.
pub mod error;

pub use bunch::{Bunch, ChannelKind, CONTROL_CHANNEL};
pub use channel::{ShadowChannel, MAX_OUTSTANDING, RESEND_WAIT};
pub use codec::{
    decode_frame, encode_frame, encode_frame_unchecked, try_decode_frame, FRAME_HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use control::{ControlMessage, HarnessCmd, HELLO_MAGIC};
pub use error::{WireError, WireResult};
