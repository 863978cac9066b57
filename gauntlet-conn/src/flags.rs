//! Harness flag set.
//!
//! Static configuration bits controlling which protocol events are
//! intercepted and which preconditions gate a probe's main payload.
//! Flag combinations carry dependency rules (you cannot require a pawn
//! without requiring a player controller, and so on); [`validate_flags`]
//! enforces them before a probe is ever queued.

use crate::error::{ConnError, ConnResult};

bitflags::bitflags! {
    /// Behavior and requirement bits for one probe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct HarnessFlags: u32 {
        /// Launch a server process for this probe.
        const LAUNCH_SERVER = 1 << 0;
        /// Launch a full client process alongside the fake client.
        const LAUNCH_CLIENT = 1 << 1;
        /// Accept actor channels from the server.
        const ACCEPT_ACTORS = 1 << 2;
        /// Accept replication of a player controller.
        const ACCEPT_PLAYER_CONTROLLER = 1 << 3;
        /// Accept inbound remote procedure calls.
        const ACCEPT_RPCS = 1 << 4;
        /// Allow the fake client to send remote procedure calls.
        const SEND_RPCS = 1 << 5;
        /// Skip the `Join` control message after login.
        const SKIP_CONTROL_JOIN = 1 << 6;
        /// Connect to the server's beacon port instead of the game port.
        const BEACON_CONNECT = 1 << 7;
        /// Tear down and reconnect from scratch on unexpected net failure.
        const AUTO_RECONNECT = 1 << 8;

        /// Payload requires a replicated player controller.
        const REQUIRE_PLAYER_CONTROLLER = 1 << 9;
        /// Payload requires a possessed pawn.
        const REQUIRE_PAWN = 1 << 10;
        /// Payload requires a completed ping round trip.
        const REQUIRE_PING = 1 << 11;
        /// Payload requires the server-side marker actor to replicate.
        const REQUIRE_MARKER_ACTOR = 1 << 12;
        /// Payload requires a replicated beacon actor.
        const REQUIRE_BEACON = 1 << 13;
        /// Payload requires a custom, probe-defined condition.
        const REQUIRE_CUSTOM = 1 << 14;

        /// The probe intends to crash the server.
        const EXPECT_SERVER_CRASH = 1 << 15;
        /// Debug only: don't fail the probe on a server crash.
        const IGNORE_SERVER_CRASH = 1 << 16;
        /// Debug only: don't fail the probe on a client crash.
        const IGNORE_CLIENT_CRASH = 1 << 17;
        /// Debug only: don't fail the probe on disconnect.
        const IGNORE_DISCONNECT = 1 << 18;

        /// Deliver per-actor replication notifications.
        const NOTIFY_NET_ACTORS = 1 << 19;
        /// Deliver process lifecycle event notifications.
        const NOTIFY_PROCESS_EVENT = 1 << 20;

        /// Hook raw received packets.
        const CAPTURE_RECEIVED_RAW = 1 << 21;
        /// Hook raw sent packets.
        const CAPTURE_SEND_RAW = 1 << 22;
        /// Hex-dump received raw packets to the log.
        const DUMP_RECEIVED_RAW = 1 << 23;
        /// Hex-dump sent raw packets to the log.
        const DUMP_SEND_RAW = 1 << 24;
        /// Log every control message.
        const DUMP_CONTROL_MESSAGES = 1 << 25;
        /// Log every received RPC.
        const DUMP_RECEIVED_RPC = 1 << 26;
        /// Log every sent RPC.
        const DUMP_SEND_RPC = 1 << 27;
    }
}

impl Default for HarnessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl HarnessFlags {
    /// All bits that gate payload execution.
    pub const REQUIREMENTS_MASK: HarnessFlags = HarnessFlags::REQUIRE_PLAYER_CONTROLLER
        .union(HarnessFlags::REQUIRE_PAWN)
        .union(HarnessFlags::REQUIRE_PING)
        .union(HarnessFlags::REQUIRE_MARKER_ACTOR)
        .union(HarnessFlags::REQUIRE_BEACON)
        .union(HarnessFlags::REQUIRE_CUSTOM);

    /// The requirement bits set on this flag value.
    pub fn requirements(self) -> HarnessFlags {
        self & Self::REQUIREMENTS_MASK
    }
}

/// Validate the flag dependency rules.
///
/// `work_in_progress` relaxes the debug-only rules the way an unfinished
/// probe is allowed to; finalized probes must handle every crash path.
///
/// # Errors
///
/// Returns `InvalidFlags` naming the first violated rule.
pub fn validate_flags(flags: HarnessFlags, work_in_progress: bool) -> ConnResult<()> {
    let rule = |ok: bool, rule: &'static str| {
        if ok {
            Ok(())
        } else {
            Err(ConnError::InvalidFlags { rule })
        }
    };

    // Probes always launch (or attach to) a server
    rule(
        flags.contains(HarnessFlags::LAUNCH_SERVER),
        "probes must launch a server",
    )?;

    rule(
        !flags.contains(HarnessFlags::LAUNCH_CLIENT) || flags.contains(HarnessFlags::LAUNCH_SERVER),
        "launching a client requires launching a server",
    )?;

    // Requiring a player or marker actor means accepting actor channels
    rule(
        !flags.intersects(HarnessFlags::ACCEPT_PLAYER_CONTROLLER | HarnessFlags::REQUIRE_MARKER_ACTOR)
            || flags.contains(HarnessFlags::ACCEPT_ACTORS),
        "player controller / marker actor need actor channels accepted",
    )?;

    rule(
        !flags.contains(HarnessFlags::REQUIRE_PLAYER_CONTROLLER)
            || flags.contains(HarnessFlags::ACCEPT_PLAYER_CONTROLLER),
        "cannot require a player controller without accepting one",
    )?;

    rule(
        !flags.contains(HarnessFlags::REQUIRE_PAWN)
            || flags.contains(HarnessFlags::REQUIRE_PLAYER_CONTROLLER),
        "requiring a pawn requires a player controller",
    )?;

    rule(
        !flags.contains(HarnessFlags::REQUIRE_PAWN)
            || flags.contains(HarnessFlags::NOTIFY_NET_ACTORS),
        "pawn detection needs net actor notifications",
    )?;

    // The ping requirement must be the only requirement bit
    let requirements = flags.requirements().bits();
    rule(
        !flags.contains(HarnessFlags::REQUIRE_PING) || requirements.is_power_of_two(),
        "ping requirement must be the only requirement",
    )?;

    rule(
        !flags.contains(HarnessFlags::ACCEPT_RPCS) || flags.contains(HarnessFlags::ACCEPT_ACTORS),
        "accepting RPCs requires accepting actors",
    )?;

    rule(
        !flags.contains(HarnessFlags::SEND_RPCS)
            || flags.intersects(HarnessFlags::ACCEPT_PLAYER_CONTROLLER | HarnessFlags::BEACON_CONNECT),
        "sending RPCs requires a player controller or beacon",
    )?;

    const REJECTED_BEACON_FLAGS: HarnessFlags = HarnessFlags::ACCEPT_PLAYER_CONTROLLER
        .union(HarnessFlags::REQUIRE_PLAYER_CONTROLLER)
        .union(HarnessFlags::REQUIRE_PING);

    rule(
        !flags.contains(HarnessFlags::BEACON_CONNECT) || !flags.intersects(REJECTED_BEACON_FLAGS),
        "beacon connections do not support player or ping requirements",
    )?;

    rule(
        !flags.contains(HarnessFlags::BEACON_CONNECT)
            || flags.contains(HarnessFlags::NOTIFY_NET_ACTORS),
        "beacon setup needs net actor notifications",
    )?;

    rule(
        !flags.contains(HarnessFlags::REQUIRE_BEACON) || flags.contains(HarnessFlags::BEACON_CONNECT),
        "cannot require a beacon without connecting to one",
    )?;

    rule(
        !flags.contains(HarnessFlags::DUMP_RECEIVED_RAW)
            || flags.contains(HarnessFlags::CAPTURE_RECEIVED_RAW),
        "dumping received raw packets requires capturing them",
    )?;

    rule(
        !flags.contains(HarnessFlags::DUMP_SEND_RAW) || flags.contains(HarnessFlags::CAPTURE_SEND_RAW),
        "dumping sent raw packets requires capturing them",
    )?;

    rule(
        !flags.contains(HarnessFlags::NOTIFY_NET_ACTORS) || flags.contains(HarnessFlags::ACCEPT_ACTORS),
        "net actor notifications require accepting actors",
    )?;

    rule(
        !flags.contains(HarnessFlags::REQUIRE_MARKER_ACTOR)
            || flags.contains(HarnessFlags::NOTIFY_NET_ACTORS),
        "marker actor detection needs net actor notifications",
    )?;

    // Ignore-flags are debug aids; finalized probes must handle crashes
    const IGNORE_FLAGS: HarnessFlags = HarnessFlags::IGNORE_SERVER_CRASH
        .union(HarnessFlags::IGNORE_CLIENT_CRASH)
        .union(HarnessFlags::IGNORE_DISCONNECT);

    rule(
        work_in_progress || !flags.intersects(IGNORE_FLAGS),
        "ignore-flags are only allowed on work-in-progress probes",
    )?;

    Ok(())
}
