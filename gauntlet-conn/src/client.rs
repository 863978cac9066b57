//! Fake client lifecycle and requirement gating.
//!
//! A [`FakeClient`] is a harness-driven network peer: it owns a blank
//! simulated world, one [`FakeConnection`], and the observed-state bits
//! that feed the requirements gate. It speaks just enough of the protocol
//! to make a server believe a player (or beacon) joined, then hands
//! control to probe logic through the hook registry.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use gauntlet_wire::{
    Bunch, ChannelKind, ControlMessage, HarnessCmd, CONTROL_CHANNEL, HELLO_MAGIC,
};

use crate::connection::{FakeConnection, SendOutcome};
use crate::error::{ConnError, ConnResult};
use crate::flags::HarnessFlags;
use crate::hooks::{EventContext, HookRegistry, ProbeId, RpcDirection};
use crate::transport::{RawTransport, SendFilter};
use crate::verdict::{VerdictSlot, VerificationState};

/// Protocol version the fake client claims in its `Hello`.
pub const PROTOCOL_VERSION: u32 = 4;

/// Per-run connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No connection exists.
    Disconnected,
    /// Handshake sent, waiting for the server to accept.
    Connecting,
    /// Connected, waiting for the requirements mask to be satisfied.
    AwaitingRequirements,
    /// Requirements met; the probe payload has run.
    Executing,
    /// Run finished normally.
    Completed,
    /// Run torn down early.
    Aborted,
}

/// An actor the server replicated into the simulated world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedActor {
    /// Class name of the actor.
    pub class_name: String,
    /// Channel the actor arrived on.
    pub channel: u16,
}

/// Blank world owning everything a test run replicates.
///
/// Created fresh per connection generation and destroyed wholesale on
/// teardown, so no state leaks between runs.
#[derive(Debug, Default)]
pub struct HarnessWorld {
    /// Actors replicated so far.
    pub actors: Vec<ReplicatedActor>,
    pending_actor_channels: Vec<u16>,
}

impl HarnessWorld {
    /// Channels accepted but whose actor has not yet replicated.
    pub fn pending_actor_channels(&self) -> &[u16] {
        &self.pending_actor_channels
    }
}

/// Builds a fresh transport for each connection generation.
pub type TransportFactory = Box<dyn FnMut() -> Box<dyn RawTransport>>;

type Payload = Box<dyn FnMut(&EventContext)>;

/// One simulated client and its connection lifecycle.
pub struct FakeClient {
    probe: ProbeId,
    flags: HarnessFlags,
    server_url: String,
    beacon_type: String,
    hooks: Rc<RefCell<HookRegistry>>,
    transport_factory: TransportFactory,

    conn: Option<FakeConnection>,
    world: Option<HarnessWorld>,
    phase: ConnectionPhase,
    generation: u32,
    executed: bool,
    verdict: VerdictSlot,
    payload: Option<Payload>,

    player_controller: bool,
    pawn_setup: bool,
    received_pong: bool,
    marker_actor: bool,
    beacon_seen: bool,
    custom_met: bool,
}

impl FakeClient {
    /// Create a disconnected fake client.
    pub fn new(
        probe: ProbeId,
        flags: HarnessFlags,
        server_url: impl Into<String>,
        hooks: Rc<RefCell<HookRegistry>>,
        transport_factory: TransportFactory,
    ) -> Self {
        Self {
            probe,
            flags,
            server_url: server_url.into(),
            beacon_type: String::new(),
            hooks,
            transport_factory,
            conn: None,
            world: None,
            phase: ConnectionPhase::Disconnected,
            generation: 0,
            executed: false,
            verdict: VerdictSlot::new(),
            payload: None,
            player_controller: false,
            pawn_setup: false,
            received_pong: false,
            marker_actor: false,
            beacon_seen: false,
            custom_met: false,
        }
    }

    /// Set the beacon type joined when `BEACON_CONNECT` is set.
    pub fn with_beacon_type(mut self, beacon_type: impl Into<String>) -> Self {
        self.beacon_type = beacon_type.into();
        self
    }

    /// Install the probe's main payload.
    pub fn set_payload(&mut self, payload: impl FnMut(&EventContext) + 'static) {
        self.payload = Some(Box::new(payload));
    }

    /// The probe id this client belongs to.
    pub fn probe(&self) -> ProbeId {
        self.probe
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Connection generation, bumped on every reconnect.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the payload has run this run.
    pub fn executed(&self) -> bool {
        self.executed
    }

    /// Recorded verdict.
    pub fn verdict(&self) -> VerificationState {
        self.verdict.state()
    }

    /// Record a verdict; first write wins.
    pub fn record_verdict(&mut self, state: VerificationState) -> bool {
        self.verdict.record(state)
    }

    /// Borrow the live connection.
    pub fn connection(&self) -> Option<&FakeConnection> {
        self.conn.as_ref()
    }

    /// Borrow the live connection mutably.
    pub fn connection_mut(&mut self) -> Option<&mut FakeConnection> {
        self.conn.as_mut()
    }

    /// Borrow the simulated world.
    pub fn world(&self) -> Option<&HarnessWorld> {
        self.world.as_ref()
    }

    /// Install or clear the socket-level send filter.
    pub fn set_send_filter(&mut self, filter: Option<SendFilter>) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_send_filter(filter);
        }
    }

    fn ctx(&self, channel: Option<u16>) -> EventContext {
        EventContext {
            probe: self.probe,
            generation: self.generation,
            channel,
        }
    }

    /// Create the world and connection, then send the handshake.
    ///
    /// `Hello` always goes first; `BEACON_CONNECT` substitutes `BeaconJoin`
    /// for the login sequence; `SKIP_CONTROL_JOIN` suppresses the final
    /// `Join`.
    pub fn connect(&mut self, now: Duration) -> ConnResult<()> {
        if self.conn.is_some() {
            tracing::warn!(probe = self.probe.0, "world already exists, can't create fake client");
            return Ok(());
        }

        self.generation += 1;
        self.world = Some(HarnessWorld::default());

        let transport = (self.transport_factory)();
        let mut conn = FakeConnection::new(transport);
        conn.open_channel(CONTROL_CHANNEL, ChannelKind::Control)?;
        conn.reset_receive_clock(now);
        self.conn = Some(conn);
        self.phase = ConnectionPhase::Connecting;

        self.send_control_message(
            &ControlMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                magic: HELLO_MAGIC,
            },
            now,
        )?;

        if self.flags.contains(HarnessFlags::BEACON_CONNECT) {
            self.send_control_message(
                &ControlMessage::BeaconJoin {
                    beacon_type: self.beacon_type.clone(),
                },
                now,
            )?;
        } else {
            self.send_control_message(
                &ControlMessage::Login {
                    token: format!("probe-{}", self.probe.0),
                    url: self.server_url.clone(),
                },
                now,
            )?;

            if !self.flags.contains(HarnessFlags::SKIP_CONTROL_JOIN) {
                self.send_control_message(&ControlMessage::Join, now)?;
            }
        }

        if self.flags.contains(HarnessFlags::REQUIRE_PING) {
            self.send_control_message(
                &ControlMessage::Harness(HarnessCmd::Ping, String::new()),
                now,
            )?;
        }

        tracing::info!(
            probe = self.probe.0,
            url = %self.server_url,
            generation = self.generation,
            "fake client connected"
        );

        self.phase = ConnectionPhase::AwaitingRequirements;

        // Nothing to wait for: execute immediately
        self.check_requirements();
        Ok(())
    }

    /// Encode and send a control message as a reliable control bunch.
    pub fn send_control_message(
        &mut self,
        message: &ControlMessage,
        now: Duration,
    ) -> ConnResult<SendOutcome> {
        if self.flags.contains(HarnessFlags::DUMP_CONTROL_MESSAGES) {
            tracing::debug!(probe = self.probe.0, ?message, "sending control message");
        }

        let conn = self.conn.as_mut().ok_or(ConnError::NotConnected)?;
        let bunch = conn
            .create_channel_bunch(ChannelKind::Control, CONTROL_CHANNEL, message.encode())
            .ok_or(ConnError::ControlChannelMissing)?;

        let frame = gauntlet_wire::encode_frame_unchecked(&bunch);
        let ctx = self.ctx(Some(CONTROL_CHANNEL));
        if self.flags.contains(HarnessFlags::CAPTURE_SEND_RAW) {
            self.hooks.borrow_mut().observe_pre_send(&ctx, &frame);
        }

        let conn = self.conn.as_mut().ok_or(ConnError::NotConnected)?;
        let outcome = conn.send_control_bunch(bunch, now)?;

        if outcome.sent && self.flags.contains(HarnessFlags::CAPTURE_SEND_RAW) {
            self.hooks
                .borrow_mut()
                .observe_post_send(&ctx, &outcome.socket_bytes);
            if self.flags.contains(HarnessFlags::DUMP_SEND_RAW) {
                tracing::debug!(
                    probe = self.probe.0,
                    size = outcome.socket_bytes.len(),
                    "raw send: {}",
                    hex_preview(&outcome.socket_bytes)
                );
            }
        }

        Ok(outcome)
    }

    /// Push raw bytes through the low-level send path.
    ///
    /// Subject to the socket filter and the pre/post-send observers, but
    /// not to any channel bookkeeping.
    pub fn send_raw(&mut self, bytes: &[u8], _now: Duration) -> ConnResult<SendOutcome> {
        let ctx = self.ctx(None);
        if self.flags.contains(HarnessFlags::CAPTURE_SEND_RAW) {
            self.hooks.borrow_mut().observe_pre_send(&ctx, bytes);
        }

        let conn = self.conn.as_mut().ok_or(ConnError::NotConnected)?;
        let outcome = conn.send_frame(bytes)?;

        if outcome.sent && self.flags.contains(HarnessFlags::CAPTURE_SEND_RAW) {
            self.hooks
                .borrow_mut()
                .observe_post_send(&ctx, &outcome.socket_bytes);
            if self.flags.contains(HarnessFlags::DUMP_SEND_RAW) {
                tracing::debug!(
                    probe = self.probe.0,
                    size = outcome.socket_bytes.len(),
                    "raw send: {}",
                    hex_preview(&outcome.socket_bytes)
                );
            }
        }

        Ok(outcome)
    }

    /// The requirement bits currently satisfied by observed state.
    ///
    /// Recomputed from scratch on every call; this recomputation, not any
    /// single trigger, is the authoritative execution gate.
    pub fn met_requirements(&self) -> HarnessFlags {
        let mut met = HarnessFlags::empty();

        if self.flags.contains(HarnessFlags::REQUIRE_PLAYER_CONTROLLER) && self.player_controller {
            met |= HarnessFlags::REQUIRE_PLAYER_CONTROLLER;
        }
        if self.flags.contains(HarnessFlags::REQUIRE_PAWN) && self.player_controller && self.pawn_setup
        {
            met |= HarnessFlags::REQUIRE_PAWN;
        }
        if self.flags.contains(HarnessFlags::REQUIRE_PING) && self.received_pong {
            met |= HarnessFlags::REQUIRE_PING;
        }
        if self.flags.contains(HarnessFlags::REQUIRE_MARKER_ACTOR) && self.marker_actor {
            met |= HarnessFlags::REQUIRE_MARKER_ACTOR;
        }
        if self.flags.contains(HarnessFlags::REQUIRE_BEACON) && self.beacon_seen {
            met |= HarnessFlags::REQUIRE_BEACON;
        }
        if self.flags.contains(HarnessFlags::REQUIRE_CUSTOM) && self.custom_met {
            met |= HarnessFlags::REQUIRE_CUSTOM;
        }

        met
    }

    /// Whether every required bit is also met.
    pub fn has_all_requirements(&self) -> bool {
        if self.conn.is_none() {
            return false;
        }
        let required = self.flags.requirements();
        required & self.met_requirements() == required
    }

    /// Advance to `Executing` and run the payload if the gate is open.
    ///
    /// Multiple independent signals may each call this; only the first
    /// successful attempt executes the payload.
    pub fn check_requirements(&mut self) {
        if self.phase != ConnectionPhase::AwaitingRequirements {
            return;
        }
        if !self.has_all_requirements() {
            return;
        }

        self.phase = ConnectionPhase::Executing;
        if self.executed {
            // A reconnect re-satisfied the mask; the payload already ran
            return;
        }
        self.executed = true;
        tracing::info!(probe = self.probe.0, "requirements met, executing payload");

        let ctx = self.ctx(None);
        if let Some(mut payload) = self.payload.take() {
            payload(&ctx);
            self.payload = Some(payload);
        }
    }

    /// Accept or deny a new channel by kind.
    pub fn on_channel_open_request(&mut self, kind: ChannelKind, index: u16) -> bool {
        let ctx = self.ctx(Some(index));
        let mut accepted = match kind {
            ChannelKind::Actor => self.flags.contains(HarnessFlags::ACCEPT_ACTORS),
            ChannelKind::Voice => false,
            ChannelKind::Control => index == CONTROL_CHANNEL,
        };

        if accepted && !self.hooks.borrow_mut().filter_channel(&ctx, kind, index) {
            accepted = false;
        }

        if accepted
            && kind == ChannelKind::Actor
            && self.flags.contains(HarnessFlags::NOTIFY_NET_ACTORS)
        {
            if let Some(world) = self.world.as_mut() {
                world.pending_actor_channels.push(index);
            }
        }

        accepted
    }

    /// Whether a replicated object of `class_name` may finish creating.
    ///
    /// Mirrors the requirement flags: classes the probe is waiting on are
    /// allowed through, everything else is referred to the object filter.
    pub fn allow_object_class(&self, class_name: &str) -> bool {
        if self.flags.contains(HarnessFlags::REQUIRE_MARKER_ACTOR)
            && class_name == "MarkerActor"
            && !self.marker_actor
        {
            return true;
        }
        if self.flags.contains(HarnessFlags::ACCEPT_PLAYER_CONTROLLER)
            && class_name.contains("PlayerController")
            && !self.player_controller
        {
            return true;
        }
        if self.flags.contains(HarnessFlags::REQUIRE_PAWN)
            && class_name.contains("Pawn")
            && !self.pawn_setup
        {
            return true;
        }
        if self.flags.contains(HarnessFlags::BEACON_CONNECT)
            && class_name.contains("Beacon")
            && !self.beacon_seen
        {
            return true;
        }
        false
    }

    /// Handle a fully replicated actor.
    ///
    /// Applies the object filter first. A veto mid-creation runs the
    /// control-channel workaround: the control slot is parked while the
    /// half-open actor channel is closed, so shared failure paths cannot
    /// interpret the veto as a fatal protocol error and disconnect us.
    pub fn on_actor_replicated(&mut self, class_name: &str, channel: u16) {
        let ctx = self.ctx(Some(channel));

        // The hook is the veto mechanism; classes the probe's requirements
        // are waiting on are force-accepted past a probe's spawn filter.
        let accepted = self.hooks.borrow_mut().filter_object(&ctx, class_name)
            || self.allow_object_class(class_name);

        if !accepted {
            tracing::debug!(probe = self.probe.0, class = class_name, "vetoed actor creation");
            if let Some(conn) = self.conn.as_mut() {
                let parked = conn.take_control_channel();
                conn.close_channel(channel);
                if let Some(control) = parked {
                    conn.restore_control_channel(control);
                }
            }
            return;
        }

        if let Some(world) = self.world.as_mut() {
            world.actors.push(ReplicatedActor {
                class_name: class_name.to_string(),
                channel,
            });
            world.pending_actor_channels.retain(|&c| c != channel);
        }

        if class_name.contains("PlayerController") {
            self.player_controller = true;
        } else if class_name.contains("Pawn") && self.player_controller {
            self.pawn_setup = true;
        } else if class_name == "MarkerActor" {
            self.marker_actor = true;
        } else if class_name.contains("Beacon") {
            self.beacon_seen = true;
        }

        self.check_requirements();
    }

    /// Handle a decoded control-channel bunch.
    pub fn on_control_bunch(&mut self, bunch: &Bunch) {
        let ctx = self.ctx(Some(CONTROL_CHANNEL));

        match ControlMessage::decode(&bunch.payload) {
            Ok(message) => {
                if self.flags.contains(HarnessFlags::DUMP_CONTROL_MESSAGES) {
                    tracing::debug!(probe = self.probe.0, ?message, "received control message");
                }

                if let ControlMessage::Harness(HarnessCmd::Pong, _) = message {
                    if self.flags.contains(HarnessFlags::REQUIRE_PING) && !self.received_pong {
                        self.received_pong = true;
                        self.hooks.borrow_mut().observe_control(&ctx, &message);
                        self.check_requirements();
                        return;
                    }
                }

                self.hooks.borrow_mut().observe_control(&ctx, &message);
            }
            Err(error) => {
                tracing::warn!(probe = self.probe.0, %error, "undecodable control bunch");
            }
        }
    }

    /// Mark the probe-defined custom condition satisfied.
    pub fn signal_custom(&mut self) {
        self.custom_met = true;
        self.check_requirements();
    }

    /// Observe a remote procedure invocation; returns whether it may run.
    pub fn on_rpc(&mut self, direction: RpcDirection, name: &str) -> bool {
        let ctx = self.ctx(None);

        let mut allowed = match direction {
            RpcDirection::Inbound => self.flags.contains(HarnessFlags::ACCEPT_RPCS),
            RpcDirection::Outbound => self.flags.contains(HarnessFlags::SEND_RPCS),
        };

        if !self.hooks.borrow_mut().filter_rpc(&ctx, direction, name) {
            allowed = false;
        }

        if !allowed {
            tracing::debug!(probe = self.probe.0, rpc = name, ?direction, "blocking RPC");
        } else {
            let dump = match direction {
                RpcDirection::Inbound => self.flags.contains(HarnessFlags::DUMP_RECEIVED_RPC),
                RpcDirection::Outbound => self.flags.contains(HarnessFlags::DUMP_SEND_RPC),
            };
            if dump {
                tracing::debug!(probe = self.probe.0, rpc = name, ?direction, "RPC");
            }
        }

        allowed
    }

    /// Handle an unexpected network failure.
    pub fn on_network_failure(&mut self, reason: &str, now: Duration) -> ConnResult<()> {
        tracing::warn!(probe = self.probe.0, reason, "network failure");

        if self.flags.contains(HarnessFlags::AUTO_RECONNECT) {
            // Rebuild from scratch: new world, new connection, same probe
            self.teardown_connection();
            self.player_controller = false;
            self.pawn_setup = false;
            self.received_pong = false;
            self.marker_actor = false;
            self.beacon_seen = false;
            self.phase = ConnectionPhase::Disconnected;
            return self.connect(now);
        }

        if self.verdict.state() == VerificationState::Unverified {
            if self.flags.contains(HarnessFlags::IGNORE_DISCONNECT) {
                tracing::warn!(probe = self.probe.0, "ignoring disconnect");
            } else {
                tracing::error!(
                    probe = self.probe.0,
                    reason,
                    "network failure, marking probe as needing update"
                );
                self.verdict.record(VerificationState::VerifiedNeedsUpdate);
            }
        }

        if self.verdict.state().is_verified() {
            self.cleanup();
        }
        Ok(())
    }

    /// One net tick: flush resends, decode inbound frames and dispatch
    /// control bunches. Returns the non-control bunches for probe logic.
    pub fn net_tick(&mut self, now: Duration) -> Vec<Bunch> {
        let Some(conn) = self.conn.as_mut() else {
            return Vec::new();
        };

        let bunches = conn.net_tick(now);
        let mut remaining = Vec::new();

        for bunch in bunches {
            if self.flags.contains(HarnessFlags::CAPTURE_RECEIVED_RAW) {
                let ctx = self.ctx(Some(bunch.channel));
                self.hooks.borrow_mut().observe_raw_receive(&ctx, &bunch.payload);
                if self.flags.contains(HarnessFlags::DUMP_RECEIVED_RAW) {
                    tracing::debug!(
                        probe = self.probe.0,
                        size = bunch.payload.len(),
                        "raw receive: {}",
                        hex_preview(&bunch.payload)
                    );
                }
            }

            if bunch.channel == CONTROL_CHANNEL {
                self.on_control_bunch(&bunch);
            } else {
                remaining.push(bunch);
            }
        }

        remaining
    }

    /// Mark the run finished.
    pub fn complete(&mut self) {
        if self.phase != ConnectionPhase::Aborted {
            self.phase = ConnectionPhase::Completed;
        }
    }

    /// Abort the run and tear everything down.
    pub fn abort(&mut self) {
        self.phase = ConnectionPhase::Aborted;
        self.cleanup();
    }

    fn teardown_connection(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.teardown();
        }
        self.conn = None;
        self.world = None;
    }

    /// Tear down the connection and world. Idempotent: a second call
    /// leaves the same final state and performs no second teardown.
    pub fn cleanup(&mut self) {
        let already_clean = self.conn.is_none() && self.world.is_none();

        self.teardown_connection();
        self.hooks.borrow_mut().deregister(self.probe);

        if !matches!(self.phase, ConnectionPhase::Completed | ConnectionPhase::Aborted) {
            self.phase = if self.executed {
                ConnectionPhase::Completed
            } else {
                ConnectionPhase::Aborted
            };
        }

        if !already_clean {
            tracing::debug!(probe = self.probe.0, "fake client cleaned up");
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    const PREVIEW: usize = 16;
    let shown: Vec<String> = bytes.iter().take(PREVIEW).map(|b| format!("{b:02x}")).collect();
    if bytes.len() > PREVIEW {
        format!("{} .. ({} bytes)", shown.join(" "), bytes.len())
    } else {
        format!("{} ({} bytes)", shown.join(" "), bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookSet;
    use crate::transport::LoopbackTransport;
    use gauntlet_wire::encode_frame;

    fn registry() -> Rc<RefCell<HookRegistry>> {
        Rc::new(RefCell::new(HookRegistry::new()))
    }

    fn client_with_flags(flags: HarnessFlags) -> (FakeClient, Rc<RefCell<Vec<Rc<RefCell<LoopbackTransport>>>>>) {
        let transports: Rc<RefCell<Vec<Rc<RefCell<LoopbackTransport>>>>> =
            Rc::new(RefCell::new(Vec::new()));
        let transports_clone = transports.clone();

        let factory: TransportFactory = Box::new(move || {
            let shared = LoopbackTransport::shared();
            transports_clone.borrow_mut().push(shared.clone());
            Box::new(shared)
        });

        let client = FakeClient::new(ProbeId(1), flags, "127.0.0.1:7787", registry(), factory);
        (client, transports)
    }

    fn decoded_control_messages(transport: &Rc<RefCell<LoopbackTransport>>) -> Vec<ControlMessage> {
        transport
            .borrow()
            .sent_frames()
            .iter()
            .map(|frame| {
                let bunch = gauntlet_wire::decode_frame(frame).expect("frame");
                ControlMessage::decode(&bunch.payload).expect("control message")
            })
            .collect()
    }

    #[test]
    fn test_handshake_sequence() {
        let (mut client, transports) = client_with_flags(HarnessFlags::LAUNCH_SERVER);
        client.connect(Duration::ZERO).expect("connect");

        let messages = decoded_control_messages(&transports.borrow()[0]);
        assert!(matches!(messages[0], ControlMessage::Hello { magic: HELLO_MAGIC, .. }));
        assert!(matches!(messages[1], ControlMessage::Login { .. }));
        assert!(matches!(messages[2], ControlMessage::Join));
    }

    #[test]
    fn test_handshake_skip_join() {
        let (mut client, transports) =
            client_with_flags(HarnessFlags::LAUNCH_SERVER | HarnessFlags::SKIP_CONTROL_JOIN);
        client.connect(Duration::ZERO).expect("connect");

        let messages = decoded_control_messages(&transports.borrow()[0]);
        assert_eq!(messages.len(), 2);
        assert!(!messages.iter().any(|m| matches!(m, ControlMessage::Join)));
    }

    #[test]
    fn test_beacon_handshake() {
        let flags = HarnessFlags::LAUNCH_SERVER
            | HarnessFlags::BEACON_CONNECT
            | HarnessFlags::ACCEPT_ACTORS
            | HarnessFlags::NOTIFY_NET_ACTORS;
        let (client, transports) = client_with_flags(flags);
        let mut client = client.with_beacon_type("TestBeacon");
        client.connect(Duration::ZERO).expect("connect");

        let messages = decoded_control_messages(&transports.borrow()[0]);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ControlMessage::BeaconJoin { beacon_type } if beacon_type == "TestBeacon")));
        assert!(!messages.iter().any(|m| matches!(m, ControlMessage::Login { .. })));
    }

    #[test]
    fn test_no_requirements_executes_immediately() {
        let (mut client, _) = client_with_flags(HarnessFlags::LAUNCH_SERVER);
        let executed = Rc::new(RefCell::new(0));
        let executed_clone = executed.clone();
        client.set_payload(move |_| *executed_clone.borrow_mut() += 1);

        client.connect(Duration::ZERO).expect("connect");
        assert_eq!(client.phase(), ConnectionPhase::Executing);
        assert_eq!(*executed.borrow(), 1);
    }

    #[test]
    fn test_requirements_gate_player_then_pawn() {
        let flags = HarnessFlags::LAUNCH_SERVER
            | HarnessFlags::ACCEPT_ACTORS
            | HarnessFlags::ACCEPT_PLAYER_CONTROLLER
            | HarnessFlags::NOTIFY_NET_ACTORS
            | HarnessFlags::REQUIRE_PLAYER_CONTROLLER
            | HarnessFlags::REQUIRE_PAWN;
        let (mut client, _) = client_with_flags(flags);

        let executed = Rc::new(RefCell::new(0));
        let executed_clone = executed.clone();
        client.set_payload(move |_| *executed_clone.borrow_mut() += 1);
        client.connect(Duration::ZERO).expect("connect");

        assert_eq!(client.phase(), ConnectionPhase::AwaitingRequirements);

        // Player controller alone is not enough
        client.on_actor_replicated("GamePlayerController", 2);
        assert_eq!(*executed.borrow(), 0);
        assert_eq!(client.phase(), ConnectionPhase::AwaitingRequirements);

        // The pawn completes the mask; payload runs after the second event
        client.on_actor_replicated("DefaultPawn", 3);
        assert_eq!(*executed.borrow(), 1);
        assert_eq!(client.phase(), ConnectionPhase::Executing);

        // Further events never re-execute
        client.on_actor_replicated("DefaultPawn", 4);
        client.check_requirements();
        assert_eq!(*executed.borrow(), 1);
    }

    #[test]
    fn test_pong_satisfies_ping_requirement() {
        let flags = HarnessFlags::LAUNCH_SERVER | HarnessFlags::REQUIRE_PING;
        let (mut client, transports) = client_with_flags(flags);

        let executed = Rc::new(RefCell::new(0));
        let executed_clone = executed.clone();
        client.set_payload(move |_| *executed_clone.borrow_mut() += 1);
        client.connect(Duration::ZERO).expect("connect");

        // Ping went out with the handshake
        let messages = decoded_control_messages(&transports.borrow()[0]);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ControlMessage::Harness(HarnessCmd::Ping, _))));
        assert_eq!(*executed.borrow(), 0);

        // Server answers with a pong
        let pong = ControlMessage::Harness(HarnessCmd::Pong, String::new());
        let bunch = Bunch::new(CONTROL_CHANNEL, ChannelKind::Control, 1, pong.encode())
            .expect("bunch");
        transports.borrow()[0]
            .borrow_mut()
            .inject(encode_frame(&bunch).expect("encode"));

        client.net_tick(Duration::from_millis(16));
        assert_eq!(*executed.borrow(), 1);
        assert_eq!(client.phase(), ConnectionPhase::Executing);
    }

    #[test]
    fn test_network_failure_marks_needs_update() {
        let (mut client, _) = client_with_flags(HarnessFlags::LAUNCH_SERVER);
        client.connect(Duration::ZERO).expect("connect");

        client
            .on_network_failure("socket closed", Duration::from_secs(1))
            .expect("failure handling");
        assert_eq!(client.verdict(), VerificationState::VerifiedNeedsUpdate);
        assert!(client.connection().is_none());
    }

    #[test]
    fn test_network_failure_ignored_when_flagged() {
        let (mut client, _) =
            client_with_flags(HarnessFlags::LAUNCH_SERVER | HarnessFlags::IGNORE_DISCONNECT);
        client.connect(Duration::ZERO).expect("connect");

        client
            .on_network_failure("socket closed", Duration::from_secs(1))
            .expect("failure handling");
        assert_eq!(client.verdict(), VerificationState::Unverified);
        // Without a verdict the connection stays up for the probe to decide
        assert!(client.connection().is_some());
    }

    #[test]
    fn test_auto_reconnect_rebuilds_from_scratch() {
        let (mut client, transports) =
            client_with_flags(HarnessFlags::LAUNCH_SERVER | HarnessFlags::AUTO_RECONNECT);
        client.connect(Duration::ZERO).expect("connect");
        assert_eq!(client.generation(), 1);

        client
            .on_network_failure("socket closed", Duration::from_secs(2))
            .expect("reconnect");

        assert_eq!(client.generation(), 2);
        assert_eq!(client.phase(), ConnectionPhase::Executing); // no requirements
        assert_eq!(transports.borrow().len(), 2);

        // Fresh handshake on the new transport
        let messages = decoded_control_messages(&transports.borrow()[1]);
        assert!(matches!(messages[0], ControlMessage::Hello { .. }));
    }

    #[test]
    fn test_cleanup_idempotent() {
        let (mut client, _) = client_with_flags(HarnessFlags::LAUNCH_SERVER);
        client.connect(Duration::ZERO).expect("connect");

        client.cleanup();
        let phase_after_first = client.phase();
        assert!(client.connection().is_none());
        assert!(client.world().is_none());

        client.cleanup();
        assert_eq!(client.phase(), phase_after_first);
        assert!(client.connection().is_none());
        assert!(client.world().is_none());
    }

    #[test]
    fn test_vetoed_actor_parks_control_channel() {
        let flags = HarnessFlags::LAUNCH_SERVER | HarnessFlags::ACCEPT_ACTORS;
        let hooks = registry();
        hooks
            .borrow_mut()
            .register(ProbeId(1), HookSet::new().on_object(|_, class| class != "ExploitActor"));

        let factory: TransportFactory = Box::new(|| Box::new(LoopbackTransport::new()));
        let mut client = FakeClient::new(ProbeId(1), flags, "127.0.0.1:7787", hooks, factory);
        client.connect(Duration::ZERO).expect("connect");

        client.on_actor_replicated("ExploitActor", 4);

        // Veto closed the actor channel but the control channel survived
        let conn = client.connection().expect("connection");
        assert!(conn.has_control_channel());
        assert!(conn.channel(4).is_none());
        assert!(client.world().expect("world").actors.is_empty());
    }

    #[test]
    fn test_custom_requirement_gates_until_signalled() {
        let flags = HarnessFlags::LAUNCH_SERVER | HarnessFlags::REQUIRE_CUSTOM;
        let (mut client, _) = client_with_flags(flags);

        let executed = Rc::new(RefCell::new(0));
        let executed_clone = executed.clone();
        client.set_payload(move |_| *executed_clone.borrow_mut() += 1);
        client.connect(Duration::ZERO).expect("connect");

        assert_eq!(client.phase(), ConnectionPhase::AwaitingRequirements);
        assert_eq!(*executed.borrow(), 0);

        client.signal_custom();
        assert_eq!(*executed.borrow(), 1);
        assert_eq!(client.phase(), ConnectionPhase::Executing);
    }

    #[test]
    fn test_rpc_gating() {
        let (mut client, _) = client_with_flags(
            HarnessFlags::LAUNCH_SERVER | HarnessFlags::ACCEPT_ACTORS | HarnessFlags::ACCEPT_RPCS,
        );
        client.connect(Duration::ZERO).expect("connect");

        assert!(client.on_rpc(RpcDirection::Inbound, "ClientRestart"));
        // SEND_RPCS not set
        assert!(!client.on_rpc(RpcDirection::Outbound, "ServerMove"));
    }

    #[test]
    fn test_channel_accept_respects_flags() {
        let (mut client, _) = client_with_flags(HarnessFlags::LAUNCH_SERVER);
        client.connect(Duration::ZERO).expect("connect");

        // ACCEPT_ACTORS not set
        assert!(!client.on_channel_open_request(ChannelKind::Actor, 2));
        assert!(!client.on_channel_open_request(ChannelKind::Voice, 3));
        assert!(client.on_channel_open_request(ChannelKind::Control, CONTROL_CHANNEL));
    }
}
