//! Error types for the harness.

use gauntlet_conn::ConnError;
use gauntlet_wire::WireError;

use crate::process::ProcessId;

/// Result alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur while running probes.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Connection-level failure.
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    /// Wire-level failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Subprocess operation failed.
    #[error("process error: {message}")]
    Process {
        /// Details about the failure.
        message: String,
    },

    /// Operation referenced a process the orchestrator does not own.
    #[error("unknown process: {id:?}")]
    UnknownProcess {
        /// The unresolvable process id.
        id: ProcessId,
    },

    /// A probe descriptor failed validation.
    #[error("invalid descriptor '{name}': {reason}")]
    InvalidDescriptor {
        /// Probe name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Descriptor (de)serialization failed.
    #[error("descriptor serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Spawn I/O failure.
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}
