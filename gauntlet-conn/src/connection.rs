//! The simulated client-side connection.
//!
//! One [`FakeConnection`] per probe run: a fixed table of channel slots,
//! per-channel shadow sequence state, a raw transport underneath and a
//! last-receive timestamp that drives the probe timeout. The connection is
//! destroyed and fully rebuilt on reconnect; sequence high-water marks per
//! channel index survive so recreated channels never reuse sequences.

use std::time::Duration;

use gauntlet_wire::{
    encode_frame_unchecked, try_decode_frame, Bunch, ChannelKind, ShadowChannel, CONTROL_CHANNEL,
};

use crate::error::{ConnError, ConnResult};
use crate::transport::{RawTransport, SendFilter};

/// Fixed upper bound on channel slots per connection.
pub const MAX_CHANNELS: usize = 32;

/// Result of pushing a frame at the socket layer.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Whether the frame passed the send filter and reached the transport.
    pub sent: bool,
    /// The socket bytes actually carried (empty when filtered).
    pub socket_bytes: Vec<u8>,
}

/// Simulated client-side network connection.
pub struct FakeConnection {
    transport: Box<dyn RawTransport>,
    channels: Vec<Option<ShadowChannel>>,
    seq_high_water: [u32; MAX_CHANNELS],
    last_receive: Duration,
    send_filter: Option<SendFilter>,
    recv_buffer: Vec<u8>,
    open: bool,
}

impl FakeConnection {
    /// Create a connection over `transport`. No channels exist yet; the
    /// handshake opens the control channel first.
    pub fn new(transport: impl RawTransport + 'static) -> Self {
        let mut channels = Vec::with_capacity(MAX_CHANNELS);
        channels.resize_with(MAX_CHANNELS, || None);

        Self {
            transport: Box::new(transport),
            channels,
            seq_high_water: [0; MAX_CHANNELS],
            last_receive: Duration::ZERO,
            send_filter: None,
            recv_buffer: Vec::new(),
            open: true,
        }
    }

    /// Whether the connection has not been torn down.
    pub fn is_open(&self) -> bool {
        self.open && self.transport.is_open()
    }

    /// Whether the control channel slot is occupied.
    pub fn has_control_channel(&self) -> bool {
        self.channels
            .first()
            .map(Option::is_some)
            .unwrap_or(false)
    }

    /// Timestamp of the most recent inbound data.
    pub fn last_receive(&self) -> Duration {
        self.last_receive
    }

    /// Push the last-receive timestamp forward (timeout reset).
    pub fn reset_receive_clock(&mut self, now: Duration) {
        self.last_receive = now;
    }

    /// Install or clear the socket-level send filter.
    pub fn set_send_filter(&mut self, filter: Option<SendFilter>) {
        self.send_filter = filter;
    }

    /// Open a channel at `index`.
    ///
    /// The new channel's sequence counter starts above the slot's
    /// high-water mark so recreation never reuses sequence numbers.
    pub fn open_channel(&mut self, index: u16, kind: ChannelKind) -> ConnResult<()> {
        let slot = self.slot_index(index)?;
        if self.channels[slot].is_some() {
            return Err(ConnError::ChannelSlotBusy { index });
        }

        let channel = ShadowChannel::with_initial_seq(index, kind, self.seq_high_water[slot])?;
        self.channels[slot] = Some(channel);
        tracing::debug!(channel = index, ?kind, "opened channel");
        Ok(())
    }

    /// Close the channel at `index`, recording its sequence high-water mark.
    pub fn close_channel(&mut self, index: u16) {
        let Ok(slot) = self.slot_index(index) else {
            return;
        };
        if let Some(channel) = self.channels[slot].take() {
            self.seq_high_water[slot] = self.seq_high_water[slot].max(channel.out_seq());
        }
    }

    /// Borrow a channel.
    pub fn channel(&self, index: u16) -> Option<&ShadowChannel> {
        self.channels.get(index as usize).and_then(Option::as_ref)
    }

    /// Borrow a channel mutably.
    pub fn channel_mut(&mut self, index: u16) -> Option<&mut ShadowChannel> {
        self.channels.get_mut(index as usize).and_then(Option::as_mut)
    }

    /// Allocate the next bunch for a channel, creating the channel's
    /// counter if absent.
    ///
    /// Returns `None` (failing silently, by contract) when the connection
    /// is torn down or its control channel is absent; probes treat that as
    /// "not ready yet", not as an error.
    pub fn create_channel_bunch(
        &mut self,
        kind: ChannelKind,
        index: u16,
        payload: Vec<u8>,
    ) -> Option<Bunch> {
        if !self.is_open() || !self.has_control_channel() {
            return None;
        }

        let slot = self.slot_index(index).ok()?;
        if self.channels[slot].is_none() {
            let channel = ShadowChannel::with_initial_seq(index, kind, self.seq_high_water[slot]).ok()?;
            self.channels[slot] = Some(channel);
        }

        self.channels[slot].as_mut().map(|c| c.next_bunch(payload))
    }

    /// Send a reliable bunch on the control channel.
    ///
    /// The bunch is appended to the control channel's pending-ack chain
    /// manually, bypassing any normal enqueue path (this is the control
    /// channel; other in-flight state must not be perturbed), then pushed
    /// through the raw send path.
    pub fn send_control_bunch(&mut self, bunch: Bunch, now: Duration) -> ConnResult<SendOutcome> {
        let control = self
            .channel_mut(CONTROL_CHANNEL)
            .ok_or(ConnError::ControlChannelMissing)?;
        control.record_pending(bunch.clone(), now);

        let frame = encode_frame_unchecked(&bunch);
        self.send_frame(&frame)
    }

    /// Push an encoded frame through the filter and transport.
    pub fn send_frame(&mut self, frame: &[u8]) -> ConnResult<SendOutcome> {
        if !self.open {
            return Err(ConnError::NotConnected);
        }

        if let Some(filter) = &self.send_filter {
            if !filter(frame.len()) {
                tracing::trace!(size = frame.len(), "send blocked by socket filter");
                return Ok(SendOutcome {
                    sent: false,
                    socket_bytes: Vec::new(),
                });
            }
        }

        let socket_bytes = self.transport.send(frame)?;
        Ok(SendOutcome {
            sent: true,
            socket_bytes,
        })
    }

    /// Process an acknowledgment for a channel.
    pub fn ack(&mut self, index: u16, seq: u32) -> usize {
        self.channel_mut(index).map(|c| c.ack(seq)).unwrap_or(0)
    }

    /// One net tick: retransmit overdue control bunches, then drain and
    /// decode inbound frames.
    ///
    /// Returns the decoded bunches in arrival order. A malformed inbound
    /// buffer is dropped (logged) rather than poisoning subsequent reads.
    pub fn net_tick(&mut self, now: Duration) -> Vec<Bunch> {
        if !self.open {
            return Vec::new();
        }

        // Liveness guard for the control channel's bypassed reliability
        let resends: Vec<Bunch> = self
            .channel_mut(CONTROL_CHANNEL)
            .map(|c| c.due_for_resend(now))
            .unwrap_or_default();
        for bunch in resends {
            let frame = encode_frame_unchecked(&bunch);
            if let Err(error) = self.send_frame(&frame) {
                tracing::warn!(%error, seq = bunch.seq, "control bunch resend failed");
            }
        }

        let mut received = Vec::new();
        let frames = self.transport.poll_received();
        if !frames.is_empty() {
            self.last_receive = now;
        }

        for frame in frames {
            self.recv_buffer.extend_from_slice(&frame);
        }

        loop {
            match try_decode_frame(&mut self.recv_buffer) {
                Ok(Some(bunch)) => {
                    if let Some(channel) = self.channel_mut(bunch.channel) {
                        channel.observe_incoming(bunch.seq);
                    }
                    received.push(bunch);
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(%error, "malformed inbound frame, dropping buffer");
                    self.recv_buffer.clear();
                    break;
                }
            }
        }

        received
    }

    /// Take the control channel out of the slot table.
    ///
    /// Used while unwinding a vetoed object creation: with the control
    /// channel absent, shared failure paths cannot escalate the veto into a
    /// fatal protocol error and disconnect the client. Callers must restore
    /// the channel immediately afterwards via [`restore_control_channel`].
    ///
    /// [`restore_control_channel`]: FakeConnection::restore_control_channel
    pub fn take_control_channel(&mut self) -> Option<ShadowChannel> {
        self.channels.first_mut().and_then(Option::take)
    }

    /// Put the control channel back after a veto unwind.
    pub fn restore_control_channel(&mut self, channel: ShadowChannel) {
        if let Some(slot) = self.channels.first_mut() {
            *slot = Some(channel);
        }
    }

    /// Tear the connection down: close the transport and clear every
    /// channel slot. Idempotent; a second call is a no-op.
    pub fn teardown(&mut self) {
        if !self.open && self.channels.iter().all(Option::is_none) {
            return;
        }

        for index in 0..MAX_CHANNELS as u16 {
            self.close_channel(index);
        }
        self.send_filter = None;
        self.recv_buffer.clear();
        self.transport.close();
        self.open = false;
        tracing::debug!("connection torn down");
    }

    fn slot_index(&self, index: u16) -> ConnResult<usize> {
        if (index as usize) < MAX_CHANNELS {
            Ok(index as usize)
        } else {
            Err(ConnError::ChannelOutOfRange {
                index,
                max: MAX_CHANNELS as u16 - 1,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use gauntlet_wire::encode_frame;

    fn connected() -> (FakeConnection, std::rc::Rc<std::cell::RefCell<LoopbackTransport>>) {
        let shared = LoopbackTransport::shared();
        let mut conn = FakeConnection::new(shared.clone());
        conn.open_channel(CONTROL_CHANNEL, ChannelKind::Control)
            .expect("control");
        (conn, shared)
    }

    #[test]
    fn test_create_channel_bunch_requires_control_channel() {
        let shared = LoopbackTransport::shared();
        let mut conn = FakeConnection::new(shared);

        // No control channel yet: fails silently
        assert!(conn
            .create_channel_bunch(ChannelKind::Actor, 2, vec![])
            .is_none());

        conn.open_channel(CONTROL_CHANNEL, ChannelKind::Control)
            .expect("control");
        assert!(conn
            .create_channel_bunch(ChannelKind::Actor, 2, vec![])
            .is_some());
    }

    #[test]
    fn test_create_channel_bunch_creates_counter_and_marks_open() {
        let (mut conn, _) = connected();

        let first = conn
            .create_channel_bunch(ChannelKind::Actor, 5, vec![])
            .expect("bunch");
        assert!(first.open);
        assert!(first.reliable);
        assert_eq!(first.seq, 1);

        let second = conn
            .create_channel_bunch(ChannelKind::Actor, 5, vec![])
            .expect("bunch");
        assert!(!second.open);
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn test_channel_recreation_keeps_sequences_fresh() {
        let (mut conn, _) = connected();

        let bunch = conn
            .create_channel_bunch(ChannelKind::Actor, 3, vec![])
            .expect("bunch");
        assert_eq!(bunch.seq, 1);
        conn.close_channel(3);

        let bunch = conn
            .create_channel_bunch(ChannelKind::Actor, 3, vec![])
            .expect("bunch");
        assert!(bunch.seq > 1);
    }

    #[test]
    fn test_send_control_bunch_splices_pending_ack() {
        let (mut conn, shared) = connected();

        let bunch = conn
            .create_channel_bunch(ChannelKind::Control, CONTROL_CHANNEL, b"hello".to_vec())
            .expect("bunch");
        let outcome = conn
            .send_control_bunch(bunch, Duration::ZERO)
            .expect("send");

        assert!(outcome.sent);
        assert_eq!(shared.borrow().sent_frames().len(), 1);
        assert_eq!(
            conn.channel(CONTROL_CHANNEL).expect("control").outstanding(),
            1
        );
    }

    #[test]
    fn test_control_resend_on_net_tick() {
        let (mut conn, shared) = connected();

        let bunch = conn
            .create_channel_bunch(ChannelKind::Control, CONTROL_CHANNEL, vec![])
            .expect("bunch");
        conn.send_control_bunch(bunch, Duration::ZERO).expect("send");
        assert_eq!(shared.borrow().sent_frames().len(), 1);

        // Under the resend wait: nothing happens
        conn.net_tick(Duration::from_millis(200));
        assert_eq!(shared.borrow().sent_frames().len(), 1);

        // Past the wait: the unacked bunch goes out again
        conn.net_tick(Duration::from_secs(2));
        assert_eq!(shared.borrow().sent_frames().len(), 2);

        // Acked: no further resends
        conn.ack(CONTROL_CHANNEL, 1);
        conn.net_tick(Duration::from_secs(4));
        assert_eq!(shared.borrow().sent_frames().len(), 2);
    }

    #[test]
    fn test_send_filter_blocks_mismatched_sizes() {
        let (mut conn, shared) = connected();

        let frame = vec![0u8; 64];
        conn.set_send_filter(Some(Box::new(|size| size == 100)));

        let outcome = conn.send_frame(&frame).expect("send");
        assert!(!outcome.sent);
        assert!(shared.borrow().sent_frames().is_empty());

        let frame = vec![0u8; 100];
        let outcome = conn.send_frame(&frame).expect("send");
        assert!(outcome.sent);
        assert_eq!(shared.borrow().sent_frames().len(), 1);
    }

    #[test]
    fn test_net_tick_decodes_inbound_frames() {
        let (mut conn, shared) = connected();

        let bunch = gauntlet_wire::Bunch::new(0, ChannelKind::Control, 1, b"ctl".to_vec())
            .expect("bunch");
        shared.borrow_mut().inject(encode_frame(&bunch).expect("encode"));

        let received = conn.net_tick(Duration::from_secs(3));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"ctl");
        assert_eq!(conn.last_receive(), Duration::from_secs(3));
    }

    #[test]
    fn test_net_tick_survives_malformed_frames() {
        let (mut conn, shared) = connected();

        shared.borrow_mut().inject(vec![0xFF; 40]);
        assert!(conn.net_tick(Duration::from_secs(1)).is_empty());

        // Buffer was cleared; a valid frame afterwards still decodes
        let bunch = gauntlet_wire::Bunch::new(0, ChannelKind::Control, 2, vec![]).expect("bunch");
        shared.borrow_mut().inject(encode_frame(&bunch).expect("encode"));
        assert_eq!(conn.net_tick(Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn test_control_channel_take_and_restore() {
        let (mut conn, _) = connected();
        assert!(conn.has_control_channel());

        let control = conn.take_control_channel().expect("control");
        assert!(!conn.has_control_channel());
        assert!(conn
            .create_channel_bunch(ChannelKind::Actor, 2, vec![])
            .is_none());

        conn.restore_control_channel(control);
        assert!(conn.has_control_channel());
    }

    #[test]
    fn test_teardown_idempotent() {
        let (mut conn, _) = connected();
        conn.open_channel(2, ChannelKind::Actor).expect("actor");

        conn.teardown();
        assert!(!conn.is_open());
        assert!(!conn.has_control_channel());

        // Second teardown is a no-op on the same final state
        conn.teardown();
        assert!(!conn.is_open());
        assert!(!conn.has_control_channel());
        assert!(conn.channel(2).is_none());
    }
}
