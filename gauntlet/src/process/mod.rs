//! Process orchestrator collaborator interface.
//!
//! The harness never spawns, reads or kills a process directly; everything
//! goes through [`ProcessOrchestrator`]. Live runs use
//! [`LocalOrchestrator`] (tokio subprocesses with their stdout pumped into
//! a single-producer queue, drained once per scheduler tick).
//! Deterministic tests use [`ScriptedOrchestrator`], which emits
//! pre-scripted log lines instead.

mod local;
mod scripted;

pub use local::LocalOrchestrator;
pub use scripted::ScriptedOrchestrator;

use crate::error::HarnessResult;

/// Identifier for a child process owned by an orchestrator.
///
/// The scheduler and probes hold ids, never the process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u64);

/// Suspend/resume state of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendState {
    /// Running normally.
    #[default]
    Active,
    /// Execution suspended.
    Suspended,
}

/// Collaborator contract for launching and monitoring subprocesses.
pub trait ProcessOrchestrator {
    /// Launch a process and return its handle id.
    fn start(&mut self, cmdline: &str, tag: &str) -> HarnessResult<ProcessId>;

    /// Whether the process is still running.
    fn is_running(&mut self, id: ProcessId) -> bool;

    /// Drain log lines produced since the last call.
    fn read_new_log_lines(&mut self, id: ProcessId) -> Vec<String>;

    /// Suspend the process.
    fn suspend(&mut self, id: ProcessId) -> HarnessResult<()>;

    /// Resume a suspended process.
    fn resume(&mut self, id: ProcessId) -> HarnessResult<()>;

    /// Current suspend state.
    fn suspend_state(&self, id: ProcessId) -> SuspendState;

    /// Kill the process. Idempotent.
    fn terminate(&mut self, id: ProcessId) -> HarnessResult<()>;

    /// Physical memory the process currently uses, in bytes.
    ///
    /// Zero when unknown (process gone, platform unsupported).
    fn memory_usage(&self, id: ProcessId) -> u64;
}
