//! Verification outcomes.
//!
//! Every probe run produces exactly one [`VerificationState`]. The slot is
//! write-once: the first classified outcome wins, later writes are dropped.

use serde::{Deserialize, Serialize};

/// The final classified outcome of one probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VerificationState {
    /// No outcome recorded yet.
    #[default]
    Unverified,
    /// The issue under test is fixed.
    VerifiedFixed,
    /// The issue under test still reproduces.
    VerifiedNotFixed,
    /// The probe could not produce a stable answer; rerun it.
    VerifiedUnreliable,
    /// The probe itself is broken against the current protocol.
    VerifiedNeedsUpdate,
}

impl VerificationState {
    /// Whether an outcome has been recorded.
    pub fn is_verified(self) -> bool {
        self != VerificationState::Unverified
    }
}

/// Write-once holder for a probe's verification state.
#[derive(Debug, Default, Clone)]
pub struct VerdictSlot {
    state: VerificationState,
}

impl VerdictSlot {
    /// Create an unverified slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outcome. The first write wins; later writes are ignored.
    ///
    /// Returns true when the write took effect.
    pub fn record(&mut self, state: VerificationState) -> bool {
        if self.state.is_verified() {
            tracing::debug!(
                current = ?self.state,
                ignored = ?state,
                "verdict already recorded, ignoring"
            );
            return false;
        }
        if !state.is_verified() {
            return false;
        }

        self.state = state;
        true
    }

    /// The recorded outcome, or `Unverified`.
    pub fn state(&self) -> VerificationState {
        self.state
    }
}
