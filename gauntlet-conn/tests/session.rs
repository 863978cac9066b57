//! Full fake-client session against an in-memory server double.
//!
//! The "server" here is the test itself: it decodes the frames the client
//! pushed at the loopback transport, answers the handshake, and feeds
//! replication events back in, walking the client through its whole phase
//! machine.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use gauntlet_conn::{
    ConnectionPhase, FakeClient, HarnessFlags, HookRegistry, HookSet, LoopbackTransport, ProbeId,
    VerificationState,
};
use gauntlet_wire::{
    decode_frame, encode_frame, Bunch, ChannelKind, ControlMessage, HarnessCmd, CONTROL_CHANNEL,
};

struct Session {
    client: FakeClient,
    transport: Rc<RefCell<LoopbackTransport>>,
    hooks: Rc<RefCell<HookRegistry>>,
}

fn session(flags: HarnessFlags) -> Session {
    let transport = LoopbackTransport::shared();
    let transport_clone = transport.clone();
    let hooks = Rc::new(RefCell::new(HookRegistry::new()));

    let client = FakeClient::new(
        ProbeId(1),
        flags,
        "127.0.0.1:7787",
        hooks.clone(),
        Box::new(move || Box::new(transport_clone.clone())),
    );

    Session {
        client,
        transport,
        hooks,
    }
}

fn sent_control_messages(transport: &Rc<RefCell<LoopbackTransport>>) -> Vec<ControlMessage> {
    transport
        .borrow()
        .sent_frames()
        .iter()
        .map(|frame| {
            let bunch = decode_frame(frame).expect("client frames decode");
            assert_eq!(bunch.channel, CONTROL_CHANNEL);
            ControlMessage::decode(&bunch.payload).expect("control payload decodes")
        })
        .collect()
}

fn inject_control(session: &mut Session, seq: u32, message: &ControlMessage) {
    let bunch = Bunch::new(CONTROL_CHANNEL, ChannelKind::Control, seq, message.encode())
        .expect("control bunch");
    session
        .transport
        .borrow_mut()
        .inject(encode_frame(&bunch).expect("encode"));
}

#[test]
fn test_full_session_to_execution() {
    let flags = HarnessFlags::LAUNCH_SERVER
        | HarnessFlags::ACCEPT_ACTORS
        | HarnessFlags::ACCEPT_PLAYER_CONTROLLER
        | HarnessFlags::NOTIFY_NET_ACTORS
        | HarnessFlags::REQUIRE_PLAYER_CONTROLLER
        | HarnessFlags::REQUIRE_PAWN;

    let mut session = session(flags);
    let executions = Rc::new(RefCell::new(0));
    let executions_clone = executions.clone();
    session
        .client
        .set_payload(move |_| *executions_clone.borrow_mut() += 1);

    session.client.connect(Duration::ZERO).expect("connect");
    assert_eq!(session.client.phase(), ConnectionPhase::AwaitingRequirements);

    // The server double sees a decodable Hello / Login / Join handshake,
    // every bunch reliable with strictly increasing sequence numbers
    let frames = session.transport.borrow().sent_frames().to_vec();
    let mut last_seq = 0;
    for frame in &frames {
        let bunch = decode_frame(frame).expect("decode");
        assert!(bunch.reliable);
        assert!(bunch.seq > last_seq);
        last_seq = bunch.seq;
    }
    let messages = sent_control_messages(&session.transport);
    assert!(matches!(messages[0], ControlMessage::Hello { .. }));
    assert!(matches!(messages[1], ControlMessage::Login { .. }));
    assert!(matches!(messages[2], ControlMessage::Join));

    // Server accepts actor channels for the player and pawn
    assert!(session.client.on_channel_open_request(ChannelKind::Actor, 2));
    session.client.on_actor_replicated("GamePlayerController", 2);
    assert_eq!(*executions.borrow(), 0);

    assert!(session.client.on_channel_open_request(ChannelKind::Actor, 3));
    session.client.on_actor_replicated("DefaultPawn", 3);

    // The second event completed the mask; the payload ran exactly once
    assert_eq!(*executions.borrow(), 1);
    assert_eq!(session.client.phase(), ConnectionPhase::Executing);

    // The world tracked both replicated actors
    let world = session.client.world().expect("world");
    assert_eq!(world.actors.len(), 2);
    assert!(world.pending_actor_channels().is_empty());
}

#[test]
fn test_ping_pong_over_the_wire() {
    let flags = HarnessFlags::LAUNCH_SERVER | HarnessFlags::REQUIRE_PING;
    let mut session = session(flags);
    session.client.connect(Duration::ZERO).expect("connect");

    let messages = sent_control_messages(&session.transport);
    assert!(messages
        .iter()
        .any(|m| matches!(m, ControlMessage::Harness(HarnessCmd::Ping, _))));
    assert_eq!(session.client.phase(), ConnectionPhase::AwaitingRequirements);

    // Pong comes back through the raw transport and the decode path
    inject_control(
        &mut session,
        1,
        &ControlMessage::Harness(HarnessCmd::Pong, String::new()),
    );
    session.client.net_tick(Duration::from_millis(16));

    assert_eq!(session.client.phase(), ConnectionPhase::Executing);
}

#[test]
fn test_acks_retire_pending_control_bunches() {
    let mut session = session(HarnessFlags::LAUNCH_SERVER);
    session.client.connect(Duration::ZERO).expect("connect");

    let outstanding = session
        .client
        .connection()
        .expect("connection")
        .channel(CONTROL_CHANNEL)
        .expect("control channel")
        .outstanding();
    assert_eq!(outstanding, 3); // Hello, Login, Join

    let conn = session.client.connection_mut().expect("connection");
    let last_seq = conn.channel(CONTROL_CHANNEL).expect("control").out_seq();
    conn.ack(CONTROL_CHANNEL, last_seq);
    assert_eq!(
        conn.channel(CONTROL_CHANNEL).expect("control").outstanding(),
        0
    );

    // Nothing left to resend
    let frames_before = session.transport.borrow().sent_frames().len();
    session.client.net_tick(Duration::from_secs(5));
    assert_eq!(session.transport.borrow().sent_frames().len(), frames_before);
}

#[test]
fn test_unacked_handshake_resends_after_wait() {
    let mut session = session(HarnessFlags::LAUNCH_SERVER);
    session.client.connect(Duration::ZERO).expect("connect");

    let frames_after_handshake = session.transport.borrow().sent_frames().len();

    // Within the wait: quiet
    session.client.net_tick(Duration::from_millis(500));
    assert_eq!(
        session.transport.borrow().sent_frames().len(),
        frames_after_handshake
    );

    // Past the wait: the three unacked handshake bunches go out again
    session.client.net_tick(Duration::from_millis(1500));
    assert_eq!(
        session.transport.borrow().sent_frames().len(),
        frames_after_handshake * 2
    );
}

#[test]
fn test_control_observer_sees_messages_by_probe_id() {
    let mut session = session(HarnessFlags::LAUNCH_SERVER);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    session.hooks.borrow_mut().register(
        ProbeId(1),
        HookSet::new().on_control(move |ctx, message| {
            assert_eq!(ctx.probe, ProbeId(1));
            seen_clone.borrow_mut().push(message.clone());
        }),
    );

    session.client.connect(Duration::ZERO).expect("connect");
    inject_control(
        &mut session,
        1,
        &ControlMessage::Harness(HarnessCmd::NotifyEvent, "RoundStart".into()),
    );
    session.client.net_tick(Duration::from_millis(16));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(
        matches!(&seen[0], ControlMessage::Harness(HarnessCmd::NotifyEvent, event) if event == "RoundStart")
    );
}

#[test]
fn test_disconnect_without_reconnect_flag_fails_probe() {
    let mut session = session(HarnessFlags::LAUNCH_SERVER);
    session.client.connect(Duration::ZERO).expect("connect");

    session
        .client
        .on_network_failure("connection reset by peer", Duration::from_secs(1))
        .expect("failure handling");

    assert_eq!(
        session.client.verdict(),
        VerificationState::VerifiedNeedsUpdate
    );
    assert!(session.client.connection().is_none());
    assert!(session.client.world().is_none());

    // Cleanup after the failure teardown is still idempotent
    session.client.cleanup();
    assert!(session.client.connection().is_none());
}
