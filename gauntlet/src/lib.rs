//! # Gauntlet
//!
//! A protocol-level netcode test harness. Gauntlet spins up a minimal fake
//! client, hand-builds wire-protocol bunches against a real server process,
//! intercepts replication events, and verifies (or disproves) specific
//! netcode behaviors - including deliberately malformed and boundary-case
//! traffic used to find exploits and protocol bugs.
//!
//! The top crate holds the probe state machines, the process orchestrator
//! interface, and the resource-aware scheduler that runs many probes
//! concurrently under memory and count limits.
//!
//! Scheduling is single-threaded cooperative: one driver tick processes
//! every active probe in sequence, then a fixed-interval net tick flushes
//! the fake connections, then post-tick timeout and process-exit checks
//! run. Apparent parallelism comes from time-slicing probes within one tick
//! and from the genuinely parallel server/client subprocesses, observed by
//! polling their log output.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Crash detection over subprocess log output.
pub mod crash;
/// Probe descriptors and expected-result tables.
pub mod descriptor;
/// Environment profiles (maps, parameters, server log patterns).
pub mod environment;
/// Error types for the harness.
pub mod error;
/// Probe state machines.
pub mod probe;
/// Process orchestrator collaborator interface.
pub mod process;
/// Per-probe result records and the final summary.
pub mod report;
/// Admission control, memory budgeting and the driver tick.
pub mod sched;

pub use crash::{CrashMonitor, ErrorLine, ErrorLogStage};
pub use descriptor::{ProbeDescriptor, ProbeKind, ReplayStep};
pub use environment::{EnvironmentProfile, ProgressPatterns, StandardEnvironment};
pub use error::{HarnessError, HarnessResult};
pub use probe::{Probe, ProbeStage};
pub use process::{
    LocalOrchestrator, ProcessId, ProcessOrchestrator, ScriptedOrchestrator, SuspendState,
};
pub use report::{FinalSummary, ProbeRecord};
pub use sched::{
    FixedMemory, MemoryProbe, MemoryStats, ProcMemory, Scheduler, SchedulerConfig,
};

pub use gauntlet_conn::{
    ConnectionPhase, FakeClient, HarnessFlags, HookRegistry, HookSet, ProbeId, VerdictSlot,
    VerificationState,
};
