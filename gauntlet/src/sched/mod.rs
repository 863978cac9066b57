//! Admission control, memory budgeting and the driver tick.
//!
//! The scheduler admits, runs and retires probe instances under global
//! resource limits. One cooperative `tick` processes every active probe in
//! sequence, then a fixed-interval net tick flushes the fake connections,
//! then post-tick checks sweep process exits and timeouts. Nothing runs on
//! a separate thread; the only true parallelism is the server/client
//! subprocesses, observed by polling.

mod memory;

pub use memory::{
    projected_system_peak, usage_at, worst_case_total, FixedMemory, InstanceProjection,
    MemoryProbe, MemoryStats, ProcMemory,
};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gauntlet_conn::{HookRegistry, LoopbackTransport, ProbeId, TransportFactory};

use crate::descriptor::ProbeDescriptor;
use crate::environment::EnvironmentProfile;
use crate::probe::Probe;
use crate::process::ProcessOrchestrator;
use crate::report::{FinalSummary, ProbeRecord};

/// Builds a per-probe transport factory. Live runs bridge to sockets;
/// the default builds in-memory loopbacks.
pub type TransportProvider = Box<dyn FnMut(&ProbeDescriptor) -> TransportFactory>;

/// Scheduler limits and pacing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrency cap. `None` leaves the count uncapped.
    pub max_active: Option<usize>,
    /// Admission threshold: percentage of physical memory.
    pub max_memory_percent: u8,
    /// Forced-eviction threshold, above the admission threshold.
    pub evict_memory_percent: u8,
    /// Ticks to ignore further evictions while memory stats settle.
    pub eviction_cooldown_ticks: u32,
    /// Requeue aborted probes for a later retry.
    pub allow_requeue: bool,
    /// Interval between net ticks.
    pub net_tick_interval: Duration,
    /// First probe's server port; later probes step up from here.
    pub base_port: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active: Some(4),
            // Conservative: the memory projection can undershoot
            max_memory_percent: 75,
            evict_memory_percent: 90,
            eviction_cooldown_ticks: 10,
            allow_requeue: true,
            net_tick_interval: Duration::from_millis(16),
            base_port: 7787,
        }
    }
}

/// Admits, runs and retires probe instances.
pub struct Scheduler<O: ProcessOrchestrator> {
    config: SchedulerConfig,
    orchestrator: O,
    memory: Box<dyn MemoryProbe>,
    env: Box<dyn EnvironmentProfile>,
    hooks: Rc<RefCell<HookRegistry>>,
    transports: TransportProvider,

    pending: VecDeque<ProbeDescriptor>,
    active: Vec<Probe>,
    completed: Vec<ProbeRecord>,
    aborted_counts: HashMap<String, u32>,
    unsupported: Vec<(String, String)>,
    stats_store: HashMap<String, (u64, Duration)>,

    next_probe_id: u64,
    port_offset: u16,
    aborted_first_run: bool,
    eviction_cooldown: u32,
    usage_at_cooldown: u64,
    last_net_tick: Option<Duration>,
    last_status_dump: Option<Duration>,
}

impl<O: ProcessOrchestrator> Scheduler<O> {
    /// Scheduler over an orchestrator, memory probe and environment,
    /// using in-memory loopback transports.
    pub fn new(
        config: SchedulerConfig,
        orchestrator: O,
        memory: impl MemoryProbe + 'static,
        env: impl EnvironmentProfile + 'static,
    ) -> Self {
        Self::with_transports(
            config,
            orchestrator,
            memory,
            env,
            Box::new(|_| Box::new(|| Box::new(LoopbackTransport::new()))),
        )
    }

    /// Scheduler with a custom transport provider.
    pub fn with_transports(
        config: SchedulerConfig,
        orchestrator: O,
        memory: impl MemoryProbe + 'static,
        env: impl EnvironmentProfile + 'static,
        transports: TransportProvider,
    ) -> Self {
        Self {
            config,
            orchestrator,
            memory: Box::new(memory),
            env: Box::new(env),
            hooks: Rc::new(RefCell::new(HookRegistry::new())),
            transports,
            pending: VecDeque::new(),
            active: Vec::new(),
            completed: Vec::new(),
            aborted_counts: HashMap::new(),
            unsupported: Vec::new(),
            stats_store: HashMap::new(),
            next_probe_id: 0,
            port_offset: 0,
            aborted_first_run: false,
            eviction_cooldown: 0,
            usage_at_cooldown: 0,
            last_net_tick: None,
            last_status_dump: None,
        }
    }

    /// Typed access to the orchestrator (tests script it through this).
    pub fn orchestrator_mut(&mut self) -> &mut O {
        &mut self.orchestrator
    }

    /// The shared hook registry; extra hooks can be installed per probe id.
    pub fn hooks(&self) -> Rc<RefCell<HookRegistry>> {
        self.hooks.clone()
    }

    /// Seed previous-run memory statistics for a probe name.
    pub fn set_prior_stats(&mut self, name: impl Into<String>, peak: u64, time_to_peak: Duration) {
        self.stats_store.insert(name.into(), (peak, time_to_peak));
    }

    /// Number of active instances.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of queued descriptors.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Records of completed (non-aborted) runs so far.
    pub fn completed(&self) -> &[ProbeRecord] {
        &self.completed
    }

    /// Borrow an active probe by name.
    pub fn active_probe(&self, name: &str) -> Option<&Probe> {
        self.active.iter().find(|p| p.name() == name)
    }

    /// Queue a probe for execution.
    ///
    /// Rejects invalid descriptors, probes that do not support the target
    /// environment (grouped into the final summary), and duplicates.
    pub fn queue(&mut self, descriptor: ProbeDescriptor) -> bool {
        if let Err(error) = descriptor.validate() {
            tracing::error!(%error, probe = %descriptor.name, "failed to validate probe");
            return false;
        }

        if !descriptor.supports(self.env.name()) {
            let reason = format!("does not support environment '{}'", self.env.name());
            tracing::warn!(probe = %descriptor.name, %reason, "probe unsupported");
            self.unsupported.push((descriptor.name.clone(), reason));
            return false;
        }

        let already_queued = self.pending.iter().any(|d| d.name == descriptor.name)
            || self.active.iter().any(|p| p.name() == descriptor.name);
        if already_queued {
            tracing::info!(probe = %descriptor.name, "probe already queued or active");
            return false;
        }

        tracing::info!(probe = %descriptor.name, "queued probe for execution");
        self.pending.push_back(descriptor);
        true
    }

    fn max_physical(&self) -> u64 {
        self.memory.total_physical() / 100 * u64::from(self.config.max_memory_percent)
    }

    fn evict_physical(&self) -> u64 {
        self.memory.total_physical() / 100 * u64::from(self.config.evict_memory_percent)
    }

    /// Whether a candidate fits the concurrency and memory limits.
    fn within_limits(&self, candidate: &ProbeDescriptor, now: Duration) -> bool {
        if let Some(cap) = self.config.max_active {
            if self.active.len() >= cap {
                return false;
            }
        }

        // First-run instances have no stats, so the projection cannot see
        // them; cap their count, strictly once one had to be aborted
        let first_run_cap = if self.aborted_first_run {
            2
        } else {
            self.config.max_active.unwrap_or(4)
        };
        let first_run_count = self.active.iter().filter(|p| p.stats().first_time).count();
        if first_run_count >= first_run_cap {
            return false;
        }

        let total = self.memory.total_physical();
        if total == 0 {
            // No memory numbers on this platform; count cap only
            return true;
        }

        let used = self.memory.used_physical();
        let limit = self.max_physical();
        if used >= limit {
            return false;
        }

        // Worst-case projection over active instances plus the candidate
        let mut instances: Vec<InstanceProjection> =
            self.active.iter().map(|p| p.stats().projection()).collect();
        if let Some(&(peak, time_to_peak)) = self.stats_store.get(&candidate.name) {
            instances.push(InstanceProjection {
                start_time: now,
                time_to_peak,
                peak,
                current: 0,
            });
        }

        let projected = projected_system_peak(used, &instances);
        if projected >= limit {
            tracing::debug!(
                probe = %candidate.name,
                projected_mb = projected / (1024 * 1024),
                limit_mb = limit / (1024 * 1024),
                "admission denied by memory projection"
            );
            return false;
        }

        true
    }

    /// Kick off queued probes, in order, while limits allow.
    pub fn poll_queue(&mut self, now: Duration) {
        let mut index = 0;
        while index < self.pending.len() {
            let fits = self.active.is_empty() || {
                let candidate = &self.pending[index];
                self.within_limits(candidate, now)
            };

            if !fits {
                // Doesn't fit; see if a later, smaller probe does
                index += 1;
                continue;
            }

            let Some(descriptor) = self.pending.remove(index) else {
                break;
            };
            self.launch(descriptor, now);
        }
    }

    fn launch(&mut self, descriptor: ProbeDescriptor, now: Duration) {
        self.next_probe_id += 1;
        let id = ProbeId(self.next_probe_id);

        let port = self.config.base_port + 50 + self.port_offset * 10;
        self.port_offset += 1;

        let prior = self.stats_store.get(&descriptor.name).copied();
        let transport_factory = (self.transports)(&descriptor);
        let server_addr = format!("127.0.0.1:{port}");
        let name = descriptor.name.clone();

        let mut probe = Probe::new(
            descriptor,
            id,
            server_addr,
            self.hooks.clone(),
            transport_factory,
            prior,
            self.next_probe_id,
            now,
        );

        match probe.start(&mut self.orchestrator, self.env.as_ref(), port, now) {
            Ok(()) => {
                tracing::info!(probe = %name, "started probe");
                self.active.push(probe);
            }
            Err(error) => {
                tracing::error!(probe = %name, %error, "failed to kick off probe");
                self.hooks.borrow_mut().deregister(id);
            }
        }
    }

    /// One cooperative driver tick.
    pub fn tick(&mut self, now: Duration) {
        // Per-frame hooks, in sequence
        for probe in &mut self.active {
            probe.tick(&mut self.orchestrator, now);
        }

        // Fixed-interval net tick for flushing the simulated connections
        let net_due = match self.last_net_tick {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.config.net_tick_interval,
        };
        if net_due {
            self.last_net_tick = Some(now);
            for probe in &mut self.active {
                probe.net_tick(now);
            }
        }

        // Post-tick checks
        for probe in &mut self.active {
            probe.post_tick(&mut self.orchestrator, now);
        }

        self.sweep_finished(now);
        self.enforce_memory_ceiling(now);
        self.poll_queue(now);
        self.dump_status(now);
    }

    /// Retire finished instances and record their results.
    fn sweep_finished(&mut self, now: Duration) {
        let mut index = 0;
        while index < self.active.len() {
            if !self.active[index].is_finished() {
                index += 1;
                continue;
            }

            let probe = self.active.remove(index);
            let stats = probe.stats().clone();

            if probe.aborted() {
                tracing::warn!(probe = %probe.name(), "aborted probe");
                *self.aborted_counts.entry(probe.name().to_string()).or_insert(0) += 1;

                if stats.first_time {
                    self.aborted_first_run = true;
                }
                if self.config.allow_requeue {
                    self.pending.push_back(probe.descriptor().clone());
                }
            } else {
                if stats.peak > 0 {
                    self.stats_store
                        .insert(probe.name().to_string(), (stats.peak, stats.time_to_peak));
                }

                let record = ProbeRecord {
                    name: probe.name().to_string(),
                    expected: probe.descriptor().expected_for(self.env.name()),
                    actual: probe.verdict(),
                    aborted: false,
                    duration: now.saturating_sub(probe.started_at()),
                    first_time_stats: stats.first_time,
                };
                record.log();
                self.completed.push(record);
            }
        }

        // A retirement may have made room; the caller polls the queue next
    }

    /// Abort the newest instances until usage projects back under the
    /// eviction ceiling, then cool down while memory stats settle.
    fn enforce_memory_ceiling(&mut self, _now: Duration) {
        let total = self.memory.total_physical();
        if total == 0 {
            return;
        }

        let used = self.memory.used_physical();

        if self.eviction_cooldown > 0 {
            self.eviction_cooldown -= 1;
            // Memory climbing again ends the cooldown immediately
            if used > self.usage_at_cooldown {
                self.eviction_cooldown = 0;
            }
            if self.eviction_cooldown > 0 {
                return;
            }
        }

        let ceiling = self.evict_physical();
        if self.active.is_empty() || used <= ceiling {
            return;
        }

        tracing::warn!(
            used_mb = used / (1024 * 1024),
            limit_mb = ceiling / (1024 * 1024),
            "memory limit exceeded, closing probes"
        );

        self.eviction_cooldown = self.config.eviction_cooldown_ticks;
        self.usage_at_cooldown = used;

        let mut overshoot = used - ceiling;

        // Most recently started first; launch order breaks start-time ties
        let mut order: Vec<usize> = (0..self.active.len()).collect();
        order.sort_by_key(|&i| {
            std::cmp::Reverse((self.active[i].started_at(), self.active[i].id().0))
        });

        for index in order {
            let reclaimed = self.active[index].stats().current;
            self.active[index].abort(&mut self.orchestrator);

            if reclaimed < overshoot {
                overshoot -= reclaimed;
            } else {
                break;
            }
        }
    }

    fn dump_status(&mut self, now: Duration) {
        if self.active.is_empty() && self.pending.is_empty() {
            self.last_status_dump = None;
            return;
        }

        let due = match self.last_status_dump {
            None => false, // arm the timer on the first busy tick
            Some(last) => now.saturating_sub(last) >= Duration::from_secs(10),
        };

        if self.last_status_dump.is_none() {
            self.last_status_dump = Some(now);
            return;
        }

        if due {
            self.last_status_dump = Some(now);

            let total_memory: u64 = self.active.iter().map(|p| p.stats().current).sum();
            tracing::info!("probe status:");
            tracing::info!("- active probes: {}", self.active.len());
            for probe in &self.active {
                tracing::info!(
                    "    - {} (memory usage: {}MB)",
                    probe.name(),
                    probe.stats().current / (1024 * 1024)
                );
            }
            tracing::info!("- total probe memory usage: {}MB", total_memory / (1024 * 1024));
            tracing::info!("- pending probes: {}", self.pending.len());
        }
    }

    /// Abort everything still active and drain the queue.
    pub fn abort_all(&mut self, now: Duration) {
        self.pending.clear();
        for probe in &mut self.active {
            probe.abort(&mut self.orchestrator);
        }
        self.sweep_finished(now);
    }

    /// Whether any work remains.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    /// Grouped results of the whole run.
    pub fn final_summary(&self) -> FinalSummary {
        FinalSummary {
            unsupported: self.unsupported.clone(),
            aborted: self.aborted_counts.clone(),
            completed: self.completed.clone(),
        }
    }

    /// Drive ticks on the runtime until idle or shut down.
    ///
    /// Subprocess log pumps run concurrently on the same thread; this loop
    /// never blocks on them.
    pub async fn run(&mut self, shutdown: CancellationToken) -> FinalSummary {
        let start = tokio::time::Instant::now();
        let mut interval = tokio::time::interval(self.config.net_tick_interval);

        loop {
            if self.is_idle() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::warn!("shutdown requested, aborting active probes");
                    // Requeueing during shutdown would spin forever
                    self.config.allow_requeue = false;
                    self.abort_all(start.elapsed());
                    break;
                }
                _ = interval.tick() => {
                    self.tick(start.elapsed());
                }
            }
        }

        let summary = self.final_summary();
        tracing::info!("\n{summary}");
        summary
    }
}
