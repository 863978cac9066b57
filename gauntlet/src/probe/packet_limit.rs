//! Packet-size probe.
//!
//! Hunts the protocol's stated packet-size limit from both sides: sends a
//! packet at exactly the limit (must be accepted) and one byte over it
//! (must be rejected), first through the raw transport path, then through
//! the bunch/channel path.
//!
//! Hitting an exact socket size is not trivial: the payload is randomized
//! (all but the last byte, so compression cannot produce a fixed output
//! size regardless of input length) and the bunch path adds framing on the
//! way down. The probe therefore converges: observe the size that reached
//! the socket layer, adjust the buffer length by half the previous delta,
//! and repeat, with a socket-level filter blocking every send that does not
//! match the current target exactly. Success or failure is read from the
//! server's log lines, because the server runs out-of-process.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gauntlet_conn::{FakeClient, VerificationState};
use gauntlet_wire::{ChannelKind, CONTROL_CHANNEL, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

use crate::descriptor::ProbeKind;

/// The socket-level packet size limit the server enforces.
pub const MAX_PACKET_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Convergence attempts allowed per stage.
pub const MAX_CONVERGENCE_ATTEMPTS: u32 = 16;

/// Server log marker for a receive-size error on the raw path.
pub const LOW_LEVEL_SIZE_ERROR: &str = "SE_EMSGSIZE";

/// Server log marker for an oversized or corrupt bunch.
pub const BUNCH_SIZE_ERROR: &str = "Malformed packet";

/// Server log marker for an unknown control message (bunch got through).
pub const UNKNOWN_CONTROL_ERROR: &str = "Unknown control message";

/// Server log marker for a normally accepted packet.
pub const PACKET_ACCEPTED: &str = "LogNet: Received packet";

/// Ordered stages of the packet-size probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    /// Raw path, exactly at the limit: must be accepted.
    AtLimitLowLevel,
    /// Raw path, one byte over: must be rejected.
    OverLimitLowLevel,
    /// Bunch path, exactly at the limit: must be accepted.
    AtLimitBunch,
    /// Bunch path, one byte over: must be rejected.
    OverLimitBunch,
    /// All stages passed.
    Done,
}

impl ProbeStage {
    fn is_over_limit(self) -> bool {
        matches!(self, ProbeStage::OverLimitLowLevel | ProbeStage::OverLimitBunch)
    }

    fn is_bunch_path(self) -> bool {
        matches!(self, ProbeStage::AtLimitBunch | ProbeStage::OverLimitBunch)
    }
}

/// The packet-size probe state machine.
pub struct PacketLimitProbe {
    kind: ProbeKind,
    stage: ProbeStage,
    attempts: u32,
    send_len: usize,
    last_delta: usize,
    awaiting_server: bool,
    achieved: Option<usize>,
    rng: StdRng,
}

impl PacketLimitProbe {
    /// New probe. `LowLevelProbe` runs the raw-path stages only;
    /// `BunchProbe` runs all four.
    pub fn new(kind: ProbeKind, seed: u64) -> Self {
        let mut probe = Self {
            kind,
            stage: ProbeStage::AtLimitLowLevel,
            attempts: 0,
            send_len: 0,
            last_delta: 0,
            awaiting_server: false,
            achieved: None,
            rng: StdRng::seed_from_u64(seed),
        };
        probe.enter_stage(ProbeStage::AtLimitLowLevel);
        probe
    }

    /// Current stage.
    pub fn stage(&self) -> ProbeStage {
        self.stage
    }

    /// Attempts used in the current stage.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last convergence adjustment.
    pub fn last_delta(&self) -> usize {
        self.last_delta
    }

    /// Socket size achieved in the last completed stage.
    pub fn achieved(&self) -> Option<usize> {
        self.achieved
    }

    /// Whether an over-limit packet is on the wire awaiting the server's
    /// reaction.
    pub fn awaiting_server(&self) -> bool {
        self.awaiting_server
    }

    /// The exact socket size this stage is converging toward.
    pub fn target_size(&self) -> usize {
        MAX_PACKET_SIZE + usize::from(self.stage.is_over_limit())
    }

    fn enter_stage(&mut self, stage: ProbeStage) {
        self.stage = stage;
        self.attempts = 0;
        self.last_delta = 0;
        self.awaiting_server = false;
        // Buffer starts at the protocol's stated maximum, +1 to force
        // overflow; the convergence loop absorbs any framing the send path
        // adds on the way down
        self.send_len = MAX_PACKET_SIZE + usize::from(stage.is_over_limit());
        tracing::info!(?stage, target = self.target_size(), "packet probe stage");
    }

    fn advance(&mut self) -> Option<VerificationState> {
        let next = match (self.kind, self.stage) {
            (_, ProbeStage::AtLimitLowLevel) => ProbeStage::OverLimitLowLevel,
            (ProbeKind::LowLevelProbe, ProbeStage::OverLimitLowLevel) => ProbeStage::Done,
            (_, ProbeStage::OverLimitLowLevel) => ProbeStage::AtLimitBunch,
            (_, ProbeStage::AtLimitBunch) => ProbeStage::OverLimitBunch,
            (_, ProbeStage::OverLimitBunch) => ProbeStage::Done,
            (_, ProbeStage::Done) => ProbeStage::Done,
        };

        if next == ProbeStage::Done {
            self.stage = ProbeStage::Done;
            tracing::info!("packet probe complete");
            Some(VerificationState::VerifiedFixed)
        } else {
            self.enter_stage(next);
            None
        }
    }

    /// Install this stage's exact-size filter on the client.
    pub fn install_filter(&self, client: &mut FakeClient) {
        let target = self.target_size();
        client.set_send_filter(Some(Box::new(move |size| size == target)));
    }

    /// One convergence step: build, send, observe, adjust.
    ///
    /// Returns a final verdict when the probe finishes or gives up.
    pub fn tick(&mut self, client: &mut FakeClient, now: Duration) -> Option<VerificationState> {
        if self.stage == ProbeStage::Done || self.awaiting_server {
            return None;
        }

        if self.attempts >= MAX_CONVERGENCE_ATTEMPTS {
            // Iteration limit reached: distinct from a protocol regression,
            // the probe just failed to land on the exact size
            tracing::warn!(
                stage = ?self.stage,
                attempts = self.attempts,
                "iteration limit reached, marking unreliable"
            );
            return Some(VerificationState::VerifiedUnreliable);
        }

        self.attempts += 1;
        self.install_filter(client);

        // Randomize all but the last byte
        let mut payload = vec![0u8; self.send_len];
        if payload.len() > 1 {
            let len = payload.len();
            self.rng.fill(&mut payload[..len - 1]);
        }
        if let Some(last) = payload.last_mut() {
            *last = 0xCE;
        }

        let target = self.target_size();
        let (attempted, observed) = if self.stage.is_bunch_path() {
            let attempted = FRAME_HEADER_SIZE + payload.len();
            let Some(bunch) = client.connection_mut().and_then(|c| {
                c.create_channel_bunch(ChannelKind::Control, CONTROL_CHANNEL, payload)
            }) else {
                return None; // connection not ready yet
            };
            let Some(conn) = client.connection_mut() else {
                return None;
            };
            match conn.send_control_bunch(bunch, now) {
                Ok(outcome) if outcome.sent => (attempted, outcome.socket_bytes.len()),
                Ok(_) => (attempted, attempted),
                Err(error) => {
                    tracing::warn!(%error, "bunch send failed");
                    return Some(VerificationState::VerifiedNeedsUpdate);
                }
            }
        } else {
            let attempted = payload.len();
            match client.send_raw(&payload, now) {
                Ok(outcome) if outcome.sent => (attempted, outcome.socket_bytes.len()),
                Ok(_) => (attempted, attempted),
                Err(error) => {
                    tracing::warn!(%error, "raw send failed");
                    return Some(VerificationState::VerifiedNeedsUpdate);
                }
            }
        };

        if observed == target {
            self.achieved = Some(observed);
            tracing::debug!(
                stage = ?self.stage,
                size = observed,
                attempts = self.attempts,
                "hit exact target size"
            );

            if self.stage.is_over_limit() {
                // The over-limit frame is on the wire; the server's log
                // decides whether the limit held
                self.awaiting_server = true;
                return None;
            }
            return self.advance();
        }

        // Binary-search convergence: move by half the miss
        let miss = observed.abs_diff(target);
        let delta = (miss / 2).max(1);
        self.last_delta = delta;

        if observed > target {
            self.send_len = self.send_len.saturating_sub(delta);
        } else {
            self.send_len += delta;
        }

        tracing::trace!(
            stage = ?self.stage,
            attempted,
            observed,
            target,
            delta,
            next_len = self.send_len,
            "converging"
        );
        None
    }

    /// Feed one server log line.
    ///
    /// A size-error marker in an over-limit stage is the expected rejection
    /// and advances the probe. The same marker in an at-limit stage means
    /// the server rejected a legal packet: an unexpected result that flags
    /// failure rather than advancing. A normal-acceptance marker while an
    /// over-limit frame is outstanding means the limit did not hold.
    pub fn on_server_log(&mut self, line: &str) -> Option<VerificationState> {
        if self.stage == ProbeStage::Done {
            return None;
        }

        let size_error = if self.stage.is_bunch_path() {
            line.contains(BUNCH_SIZE_ERROR) || line.contains(UNKNOWN_CONTROL_ERROR)
        } else {
            line.contains(LOW_LEVEL_SIZE_ERROR)
        };

        if size_error {
            if self.stage.is_over_limit() && self.awaiting_server {
                tracing::info!(stage = ?self.stage, line, "server rejected over-limit packet");
                self.awaiting_server = false;
                return self.advance();
            }

            tracing::error!(
                stage = ?self.stage,
                line,
                "unexpected size error, probe needs update"
            );
            return Some(VerificationState::VerifiedNeedsUpdate);
        }

        if self.stage.is_over_limit() && self.awaiting_server && line.contains(PACKET_ACCEPTED) {
            // The server swallowed an over-limit packet: regression
            tracing::error!(stage = ?self.stage, line, "over-limit packet accepted by server");
            return Some(VerificationState::VerifiedNotFixed);
        }

        None
    }
}
