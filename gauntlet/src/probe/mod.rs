//! Probe state machines.
//!
//! A [`Probe`] is one live test run: descriptor + fake client + behavior
//! machine + subprocess handles + memory statistics. The scheduler drives
//! it through three per-tick entry points (`tick`, `net_tick`, `post_tick`)
//! and reads one [`VerificationState`] out at the end.

mod exploit;
mod packet_limit;
mod replicate;

pub use exploit::ExploitReplay;
pub use packet_limit::{
    PacketLimitProbe, ProbeStage, BUNCH_SIZE_ERROR, LOW_LEVEL_SIZE_ERROR,
    MAX_CONVERGENCE_ATTEMPTS, MAX_PACKET_SIZE, PACKET_ACCEPTED, UNKNOWN_CONTROL_ERROR,
};
pub use replicate::DebugReplicate;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use gauntlet_conn::{
    FakeClient, HarnessFlags, HookRegistry, HookSet, ProbeId, TransportFactory,
    VerificationState,
};
use gauntlet_wire::ControlMessage;

use crate::crash::CrashMonitor;
use crate::descriptor::{ProbeDescriptor, ProbeKind};
use crate::environment::{EnvironmentProfile, ProgressPatterns};
use crate::error::HarnessResult;
use crate::process::{ProcessId, ProcessOrchestrator};
use crate::sched::MemoryStats;

/// Crash dumps can take a very long time; extend the timeout when one is
/// expected.
const EXPECTED_CRASH_GRACE: Duration = Duration::from_secs(120);

enum Machine {
    PacketLimit(PacketLimitProbe),
    Exploit(ExploitReplay),
    Replicate(DebugReplicate),
}

/// One scheduled test run.
pub struct Probe {
    descriptor: ProbeDescriptor,
    id: ProbeId,
    client: FakeClient,
    machine: Machine,
    crash: CrashMonitor,
    server: Option<ProcessId>,
    client_proc: Option<ProcessId>,
    patterns: ProgressPatterns,
    started_at: Duration,
    deadline: Duration,
    stats: MemoryStats,
    control_inbox: Rc<RefCell<Vec<ControlMessage>>>,
    execute_requested: Rc<RefCell<bool>>,
    payload_armed: bool,
    aborted: bool,
    finished: bool,
    crash_handled: bool,
}

impl Probe {
    /// Build a probe instance.
    ///
    /// `prior_stats` is the previous run's `(peak memory, time to peak)`,
    /// feeding the scheduler's admission projection.
    pub fn new(
        descriptor: ProbeDescriptor,
        id: ProbeId,
        server_addr: String,
        hooks: Rc<RefCell<HookRegistry>>,
        transport_factory: TransportFactory,
        prior_stats: Option<(u64, Duration)>,
        seed: u64,
        now: Duration,
    ) -> Self {
        let control_inbox: Rc<RefCell<Vec<ControlMessage>>> = Rc::new(RefCell::new(Vec::new()));
        let inbox_clone = control_inbox.clone();
        hooks.borrow_mut().register(
            id,
            HookSet::new().on_control(move |_, message| {
                inbox_clone.borrow_mut().push(message.clone());
            }),
        );

        let mut client = FakeClient::new(id, descriptor.flags, server_addr, hooks, transport_factory);
        if let Some(beacon_type) = &descriptor.beacon_type {
            client = client.with_beacon_type(beacon_type.clone());
        }

        let execute_requested = Rc::new(RefCell::new(false));
        let execute_clone = execute_requested.clone();
        client.set_payload(move |_| *execute_clone.borrow_mut() = true);

        let machine = match descriptor.kind {
            ProbeKind::LowLevelProbe | ProbeKind::BunchProbe => {
                Machine::PacketLimit(PacketLimitProbe::new(descriptor.kind, seed))
            }
            ProbeKind::ExploitReplay => Machine::Exploit(ExploitReplay::new(
                descriptor.replay.clone(),
                descriptor.fixed_pattern.clone(),
                descriptor.repro_pattern.clone(),
            )),
            ProbeKind::DebugReplicate => {
                Machine::Replicate(DebugReplicate::new(descriptor.name.clone()))
            }
        };

        let timeout = descriptor.timeout();
        Self {
            descriptor,
            id,
            client,
            machine,
            crash: CrashMonitor::new(),
            server: None,
            client_proc: None,
            patterns: ProgressPatterns::default(),
            started_at: now,
            deadline: now + timeout,
            stats: MemoryStats::new(now, prior_stats),
            control_inbox,
            execute_requested,
            payload_armed: false,
            aborted: false,
            finished: false,
            crash_handled: false,
        }
    }

    /// Probe name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Stable probe id.
    pub fn id(&self) -> ProbeId {
        self.id
    }

    /// The descriptor this run was built from.
    pub fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    /// Borrow the fake client.
    pub fn client(&self) -> &FakeClient {
        &self.client
    }

    /// Borrow the fake client mutably.
    pub fn client_mut(&mut self) -> &mut FakeClient {
        &mut self.client
    }

    /// Memory statistics for admission math.
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// When the run started.
    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Whether the run was aborted.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Whether the run has fully finished.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The verdict recorded so far.
    pub fn verdict(&self) -> VerificationState {
        self.client.verdict()
    }

    /// For packet-size probes: current stage and whether an over-limit
    /// frame is awaiting the server's reaction. `None` for other kinds.
    pub fn packet_probe_state(&self) -> Option<(ProbeStage, bool)> {
        match &self.machine {
            Machine::PacketLimit(machine) => Some((machine.stage(), machine.awaiting_server())),
            _ => None,
        }
    }

    /// Launch the server (and optional client) subprocesses.
    pub fn start(
        &mut self,
        orchestrator: &mut dyn ProcessOrchestrator,
        env: &dyn EnvironmentProfile,
        port: u16,
        now: Duration,
    ) -> HarnessResult<()> {
        self.patterns = env.server_progress_log_patterns();
        self.started_at = now;
        self.deadline = now + self.descriptor.timeout();

        let map = env.default_map(self.descriptor.flags);
        let mut parameters = env.default_server_parameters();
        if let Some(extra) = &self.descriptor.server_parameters {
            parameters.push(' ');
            parameters.push_str(extra);
        }

        let cmdline = format!("game-server {map} {parameters} -Port={port}");
        self.server = Some(orchestrator.start(&cmdline, "Server")?);

        if self.descriptor.flags.contains(HarnessFlags::LAUNCH_CLIENT) {
            let cmdline = format!("game-client 127.0.0.1:{port} -game -unattended -nosound");
            self.client_proc = Some(orchestrator.start(&cmdline, "Client")?);
        }

        tracing::info!(probe = %self.descriptor.name, port, "probe started");
        Ok(())
    }

    fn reset_deadline(&mut self, reason: &str, now: Duration, minimum: Duration) {
        let timeout = self.descriptor.timeout().max(minimum);
        let new_deadline = now + timeout;
        if new_deadline > self.deadline {
            self.deadline = new_deadline;
        }
        tracing::trace!(probe = %self.descriptor.name, reason, "timeout reset");
    }

    fn record(&mut self, state: VerificationState) {
        if self.client.record_verdict(state) {
            // Drop the probe's socket filter so teardown traffic flows
            self.client.set_send_filter(None);
        }
    }

    fn machine_server_log(&mut self, line: &str) -> Option<VerificationState> {
        match &mut self.machine {
            Machine::PacketLimit(machine) => machine.on_server_log(line),
            Machine::Exploit(machine) => machine.on_server_log(line),
            Machine::Replicate(_) => None,
        }
    }

    /// Per-frame hook: poll subprocess output and react to it.
    pub fn tick(&mut self, orchestrator: &mut dyn ProcessOrchestrator, now: Duration) {
        if self.finished || self.aborted {
            return;
        }

        let Some(server) = self.server else {
            return;
        };

        let lines = orchestrator.read_new_log_lines(server);
        if !lines.is_empty() {
            for line in &lines {
                tracing::debug!(target: "gauntlet::server_log", "[SERVER] {line}");
            }

            if self.verdict() == VerificationState::Unverified {
                self.dispatch_server_lines(&lines, now);
            }

            // Crash scanning runs regardless of verdict state
            if self.crash.scan(&lines) {
                let minimum = if self.descriptor.flags.contains(HarnessFlags::EXPECT_SERVER_CRASH) {
                    EXPECTED_CRASH_GRACE
                } else {
                    Duration::ZERO
                };
                self.reset_deadline("detected crash", now, minimum);
            }
        }

        if let Some(client_proc) = self.client_proc {
            for line in orchestrator.read_new_log_lines(client_proc) {
                tracing::debug!(target: "gauntlet::client_log", "[CLIENT] {line}");
            }
        }

        self.update_process_stats(orchestrator, now);
    }

    fn dispatch_server_lines(&mut self, lines: &[String], now: Duration) {
        // Delay the fake client until the server is demonstrably up,
        // resetting the timeout on every sign of startup progress
        if self.client.connection().is_none() && !self.aborted {
            let ready = lines
                .iter()
                .find(|line| self.patterns.ready.iter().any(|p| line.contains(p.as_str())));

            if let Some(line) = ready {
                tracing::info!(
                    probe = %self.descriptor.name,
                    %line,
                    "detected successful server startup, launching fake client"
                );
                self.reset_deadline("server ready", now, Duration::ZERO);
                if let Err(error) = self.client.connect(now) {
                    tracing::error!(%error, "failed to create fake client connection");
                    self.record(VerificationState::VerifiedNeedsUpdate);
                    return;
                }
            } else if let Some(line) = lines.iter().find(|line| {
                self.patterns
                    .start_progress
                    .iter()
                    .any(|p| line.contains(p.as_str()))
            }) {
                self.reset_deadline(&format!("server progress: {line}"), now, Duration::ZERO);
            }
        }

        if lines.iter().any(|line| {
            self.patterns
                .timeout_reset
                .iter()
                .any(|p| line.contains(p.as_str()))
        }) {
            self.reset_deadline("server timeout reset", now, Duration::ZERO);
            if let Some(conn) = self.client.connection_mut() {
                conn.reset_receive_clock(now);
            }
        }

        for line in lines {
            if let Some(verdict) = self.machine_server_log(line) {
                self.record(verdict);
                break;
            }
        }
    }

    /// Fixed-interval net tick: flush the connection and drive the machine.
    pub fn net_tick(&mut self, now: Duration) {
        if self.finished || self.aborted {
            return;
        }

        let _actor_bunches = self.client.net_tick(now);

        // Control messages observed by the hook since the last tick
        let inbox: Vec<ControlMessage> = self.control_inbox.borrow_mut().drain(..).collect();
        let mut verdicts = Vec::new();
        if let Machine::Replicate(machine) = &mut self.machine {
            for message in &inbox {
                if let Some(verdict) = machine.on_control(message) {
                    verdicts.push(verdict);
                }
            }
        }
        for verdict in verdicts {
            self.record(verdict);
        }

        if *self.execute_requested.borrow() && !self.payload_armed {
            self.payload_armed = true;
            tracing::debug!(probe = %self.descriptor.name, "payload armed");
        }

        if self.payload_armed && self.verdict() == VerificationState::Unverified {
            let verdict = match &mut self.machine {
                Machine::PacketLimit(machine) => machine.tick(&mut self.client, now),
                Machine::Exploit(machine) => {
                    machine.execute(&mut self.client, now);
                    None
                }
                Machine::Replicate(machine) => {
                    machine.execute(&mut self.client, now);
                    None
                }
            };
            if let Some(verdict) = verdict {
                self.record(verdict);
            }
        }
    }

    /// Post-tick checks: process exits and the run timeout.
    pub fn post_tick(&mut self, orchestrator: &mut dyn ProcessOrchestrator, now: Duration) {
        if self.finished || self.aborted {
            return;
        }

        if let Some(server) = self.server {
            if !orchestrator.is_running(server) && !self.crash_handled {
                self.crash_handled = true;
                self.handle_server_exit(now);
            }
        }

        if let Some(client_proc) = self.client_proc {
            if !orchestrator.is_running(client_proc)
                && self.verdict() == VerificationState::Unverified
                && !self.descriptor.flags.contains(HarnessFlags::IGNORE_CLIENT_CRASH)
            {
                tracing::error!(
                    probe = %self.descriptor.name,
                    "unexpected client exit, marking probe as needing update"
                );
                self.record(VerificationState::VerifiedNeedsUpdate);
            }
        }

        if now >= self.deadline && self.verdict() == VerificationState::Unverified {
            tracing::error!(probe = %self.descriptor.name, "probe timed out");
            self.record(VerificationState::VerifiedNeedsUpdate);
        }

        if self.verdict().is_verified() {
            self.finish(orchestrator);
        }
    }

    fn handle_server_exit(&mut self, _now: Duration) {
        tracing::info!(probe = %self.descriptor.name, "server process has finished, cleaning up fake client");

        let flags = self.descriptor.flags;
        if self.crash.crashed() {
            for line in self.crash.description_lines() {
                tracing::error!(probe = %self.descriptor.name, "server crash: {line}");
            }

            if flags.contains(HarnessFlags::EXPECT_SERVER_CRASH) {
                let verdict = match &mut self.machine {
                    Machine::Exploit(machine) => machine.on_server_crash(true),
                    // Crash expected and delivered: the issue reproduced
                    _ => VerificationState::VerifiedNotFixed,
                };
                self.record(verdict);
            } else if flags.contains(HarnessFlags::IGNORE_SERVER_CRASH) {
                tracing::warn!(
                    probe = %self.descriptor.name,
                    "got server crash, but probe not marked as expecting one"
                );
            } else {
                self.record(VerificationState::VerifiedNeedsUpdate);
            }
        } else if self.verdict() == VerificationState::Unverified
            && !flags.contains(HarnessFlags::IGNORE_SERVER_CRASH)
        {
            tracing::error!(
                probe = %self.descriptor.name,
                "unexpected server exit, marking probe as needing update"
            );
            self.record(VerificationState::VerifiedNeedsUpdate);
        }

        self.client.cleanup();
    }

    fn update_process_stats(&mut self, orchestrator: &mut dyn ProcessOrchestrator, now: Duration) {
        let mut usage = 0;
        for id in [self.server, self.client_proc].into_iter().flatten() {
            usage += orchestrator.memory_usage(id);
        }
        self.stats.update(now, usage);
    }

    fn finish(&mut self, orchestrator: &mut dyn ProcessOrchestrator) {
        self.finished = true;
        self.client.complete();
        self.client.cleanup();

        for id in [self.server.take(), self.client_proc.take()].into_iter().flatten() {
            if let Err(error) = orchestrator.terminate(id) {
                tracing::warn!(%error, "terminate failed during probe finish");
            }
        }
    }

    /// Cooperative abort: tear down the client and subprocesses now; the
    /// scheduler removes the instance on its next poll.
    pub fn abort(&mut self, orchestrator: &mut dyn ProcessOrchestrator) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.finished = true;

        tracing::warn!(probe = %self.descriptor.name, "aborting probe");
        self.client.abort();

        for id in [self.server.take(), self.client_proc.take()].into_iter().flatten() {
            if let Err(error) = orchestrator.terminate(id) {
                tracing::warn!(%error, "terminate failed during abort");
            }
        }
    }
}
