//! # Gauntlet Fake Client
//!
//! A minimal, fake game client: it owns a simulated world and a single
//! [`FakeConnection`], speaks the bunch wire protocol without running any
//! game logic, and exposes hook points for every protocol event so probe
//! logic can accept, deny or observe what the server replicates.
//!
//! The connection lifecycle is a small state machine:
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingRequirements -> Executing
//!                                                    -> { Completed | Aborted }
//! ```
//!
//! A probe's main payload runs the first time every bit of its
//! [`HarnessFlags`] requirements mask is also present in the met bitset,
//! recomputed after every relevant event. The recomputation is the
//! authoritative gate; the payload never runs twice for one connection
//! generation.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Fake client state machine and requirement gating.
pub mod client;
/// The simulated client-side connection.
pub mod connection;
/// Error types for connection operations.
pub mod error;
/// Harness flag set and validation rules.
pub mod flags;
/// Typed hook registry keyed by probe id.
pub mod hooks;
/// Raw transport abstraction under the connection.
pub mod transport;
/// Verification outcomes.
pub mod verdict;

pub use client::{
    ConnectionPhase, FakeClient, HarnessWorld, ReplicatedActor, TransportFactory,
};
pub use connection::{FakeConnection, SendOutcome, MAX_CHANNELS};
pub use error::{ConnError, ConnResult};
pub use flags::{validate_flags, HarnessFlags};
pub use hooks::{EventContext, HookRegistry, HookSet, ProbeId, RpcDirection};
pub use transport::{ChannelTransport, LoopbackTransport, RawTransport, SendFilter};
pub use verdict::{VerdictSlot, VerificationState};
