//! Shadow channel bookkeeping.
//!
//! The harness never mutates a real connection's reliable-channel internals.
//! Instead each channel it touches gets a [`ShadowChannel`]: an owned arena
//! of bunches plus an explicit pending-ack list, spliced *next to* whatever
//! the server believes the channel state is.

use std::collections::VecDeque;
use std::time::Duration;

use crate::bunch::{Bunch, ChannelKind, CONTROL_CHANNEL};
use crate::error::WireError;

/// How long a reliable bunch may sit unacknowledged before it is resent.
///
/// The control channel deliberately bypasses the engine's own reliability
/// path, so this guard is the only thing standing between a silent drop and
/// a hung handshake.
pub const RESEND_WAIT: Duration = Duration::from_secs(1);

/// Cap on outstanding reliable bunches eligible for the resend guard.
pub const MAX_OUTSTANDING: usize = 8;

/// A reliable bunch retained until acknowledged.
#[derive(Debug, Clone)]
struct PendingBunch {
    bunch: Bunch,
    last_send: Duration,
}

/// Per-channel sequence and acknowledgment state, owned by the harness.
#[derive(Debug)]
pub struct ShadowChannel {
    index: u16,
    kind: ChannelKind,
    out_seq: u32,
    in_seq: u32,
    open_sent: bool,
    pending_acks: VecDeque<PendingBunch>,
}

impl ShadowChannel {
    /// Create a shadow channel at `index`.
    ///
    /// # Errors
    ///
    /// Returns `ReservedChannel` when a non-control kind claims index 0.
    pub fn new(index: u16, kind: ChannelKind) -> Result<Self, WireError> {
        Self::with_initial_seq(index, kind, 0)
    }

    /// Create a shadow channel whose outgoing sequence starts above
    /// `high_water`.
    ///
    /// Used when a channel is recreated at the same index within one
    /// connection lifetime: sequence numbers must never be reused.
    pub fn with_initial_seq(index: u16, kind: ChannelKind, high_water: u32) -> Result<Self, WireError> {
        if index == CONTROL_CHANNEL && kind != ChannelKind::Control {
            return Err(WireError::ReservedChannel { kind });
        }

        Ok(Self {
            index,
            kind,
            out_seq: high_water,
            in_seq: 0,
            open_sent: false,
            pending_acks: VecDeque::new(),
        })
    }

    /// Channel index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Channel kind.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Highest outgoing sequence number assigned so far.
    pub fn out_seq(&self) -> u32 {
        self.out_seq
    }

    /// Highest incoming sequence number observed so far.
    pub fn in_seq(&self) -> u32 {
        self.in_seq
    }

    /// Allocate the channel's next outbound bunch.
    ///
    /// Assigns the next sequence number, marks the bunch as the channel's
    /// open bunch if no prior open packet exists, and marks it reliable.
    pub fn next_bunch(&mut self, payload: Vec<u8>) -> Bunch {
        self.out_seq += 1;

        let mut bunch = Bunch {
            channel: self.index,
            kind: self.kind,
            seq: self.out_seq,
            reliable: true,
            open: false,
            close: false,
            payload,
        };

        if !self.open_sent {
            self.open_sent = true;
            bunch.open = true;
        }

        bunch
    }

    /// Append a reliable bunch to the pending-ack chain.
    ///
    /// This is the manual splice: the bunch goes straight onto the shadow
    /// list, bypassing any normal enqueue path, so other in-flight state is
    /// not perturbed.
    pub fn record_pending(&mut self, bunch: Bunch, now: Duration) {
        debug_assert!(bunch.reliable);
        self.pending_acks.push_back(PendingBunch {
            bunch,
            last_send: now,
        });
    }

    /// Process an acknowledgment for `seq`.
    ///
    /// Removes every pending bunch with a sequence at or below `seq`.
    /// Returns the number of bunches retired.
    pub fn ack(&mut self, seq: u32) -> usize {
        let before = self.pending_acks.len();
        self.pending_acks.retain(|pending| pending.bunch.seq > seq);
        let retired = before - self.pending_acks.len();

        if retired > 0 {
            tracing::trace!(
                channel = self.index,
                seq,
                retired,
                "retired acknowledged bunches"
            );
        }

        retired
    }

    /// Record an inbound sequence number, returning false for stale data.
    pub fn observe_incoming(&mut self, seq: u32) -> bool {
        if seq <= self.in_seq {
            return false;
        }
        self.in_seq = seq;
        true
    }

    /// Number of reliable bunches awaiting acknowledgment.
    pub fn outstanding(&self) -> usize {
        self.pending_acks.len()
    }

    /// Collect bunches that are due for retransmission.
    ///
    /// A bunch is due when it has sat unacknowledged longer than
    /// [`RESEND_WAIT`] and fewer than [`MAX_OUTSTANDING`] bunches are
    /// pending. With the cap exceeded, the channel is presumed broken
    /// beyond what resends can fix and nothing is retransmitted.
    pub fn due_for_resend(&mut self, now: Duration) -> Vec<Bunch> {
        if self.pending_acks.len() >= MAX_OUTSTANDING {
            tracing::warn!(
                channel = self.index,
                outstanding = self.pending_acks.len(),
                "too many unacknowledged bunches, suppressing resend"
            );
            return Vec::new();
        }

        let mut due = Vec::new();
        for pending in self.pending_acks.iter_mut() {
            if now.saturating_sub(pending.last_send) >= RESEND_WAIT {
                pending.last_send = now;
                due.push(pending.bunch.clone());
            }
        }

        if !due.is_empty() {
            tracing::debug!(channel = self.index, count = due.len(), "resending unacked bunches");
        }

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_channel() -> ShadowChannel {
        ShadowChannel::new(CONTROL_CHANNEL, ChannelKind::Control).expect("channel")
    }

    #[test]
    fn test_sequence_strictly_increasing() {
        let mut chan = control_channel();

        let mut last = 0;
        for _ in 0..100 {
            let bunch = chan.next_bunch(vec![]);
            assert!(bunch.seq > last);
            last = bunch.seq;
        }
    }

    #[test]
    fn test_first_bunch_marked_open_and_reliable() {
        let mut chan = control_channel();

        let first = chan.next_bunch(vec![]);
        assert!(first.open);
        assert!(first.reliable);

        let second = chan.next_bunch(vec![]);
        assert!(!second.open);
        assert!(second.reliable);
    }

    #[test]
    fn test_recreated_channel_never_reuses_sequences() {
        let mut chan = ShadowChannel::new(4, ChannelKind::Actor).expect("channel");
        for _ in 0..5 {
            chan.next_bunch(vec![]);
        }
        let high_water = chan.out_seq();

        let mut recreated =
            ShadowChannel::with_initial_seq(4, ChannelKind::Actor, high_water).expect("channel");
        let bunch = recreated.next_bunch(vec![]);
        assert!(bunch.seq > high_water);
    }

    #[test]
    fn test_ack_retires_at_or_below() {
        let mut chan = control_channel();
        let now = Duration::ZERO;

        for _ in 0..4 {
            let bunch = chan.next_bunch(vec![]);
            chan.record_pending(bunch, now);
        }
        assert_eq!(chan.outstanding(), 4);

        assert_eq!(chan.ack(2), 2);
        assert_eq!(chan.outstanding(), 2);

        // Re-acking is a no-op
        assert_eq!(chan.ack(2), 0);

        assert_eq!(chan.ack(100), 2);
        assert_eq!(chan.outstanding(), 0);
    }

    #[test]
    fn test_resend_after_wait() {
        let mut chan = control_channel();

        let bunch = chan.next_bunch(b"hello".to_vec());
        chan.record_pending(bunch.clone(), Duration::ZERO);

        // Not yet due
        assert!(chan.due_for_resend(Duration::from_millis(500)).is_empty());

        // Due after the wait
        let due = chan.due_for_resend(Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].seq, bunch.seq);

        // last_send was refreshed, so immediately after it is not due again
        assert!(chan.due_for_resend(Duration::from_millis(1500)).is_empty());
        assert_eq!(chan.due_for_resend(Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn test_resend_suppressed_at_cap() {
        let mut chan = control_channel();

        for _ in 0..MAX_OUTSTANDING {
            let bunch = chan.next_bunch(vec![]);
            chan.record_pending(bunch, Duration::ZERO);
        }

        assert!(chan.due_for_resend(Duration::from_secs(5)).is_empty());

        // Dropping below the cap re-enables the guard
        chan.ack(1);
        assert_eq!(
            chan.due_for_resend(Duration::from_secs(5)).len(),
            MAX_OUTSTANDING - 1
        );
    }

    #[test]
    fn test_incoming_sequence_tracking() {
        let mut chan = control_channel();

        assert!(chan.observe_incoming(1));
        assert!(chan.observe_incoming(3));
        assert!(!chan.observe_incoming(3));
        assert!(!chan.observe_incoming(2));
        assert_eq!(chan.in_seq(), 3);
    }
}
