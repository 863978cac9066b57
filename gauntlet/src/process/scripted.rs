//! Deterministic orchestrator for tests.

use std::collections::{HashMap, VecDeque};

use crate::error::{HarnessError, HarnessResult};

use super::{ProcessId, ProcessOrchestrator, SuspendState};

#[derive(Default)]
struct ScriptedProcess {
    queued_lines: VecDeque<Vec<String>>,
    running: bool,
    suspend_state: SuspendState,
    memory: u64,
}

/// In-memory orchestrator emitting pre-scripted log batches.
///
/// Each [`read_new_log_lines`] call pops the next queued batch for the
/// process, so a test controls exactly which server output arrives on
/// which scheduler tick.
///
/// [`read_new_log_lines`]: ProcessOrchestrator::read_new_log_lines
#[derive(Default)]
pub struct ScriptedOrchestrator {
    processes: HashMap<ProcessId, ScriptedProcess>,
    next_id: u64,
    started: Vec<(ProcessId, String)>,
}

impl ScriptedOrchestrator {
    /// Empty orchestrator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes started so far, as `(id, cmdline)` pairs.
    pub fn started(&self) -> &[(ProcessId, String)] {
        &self.started
    }

    /// Queue a batch of log lines for one future poll.
    pub fn push_log_batch(&mut self, id: ProcessId, lines: Vec<String>) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.queued_lines.push_back(lines);
        }
    }

    /// Script the process's reported memory usage.
    pub fn set_memory(&mut self, id: ProcessId, bytes: u64) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.memory = bytes;
        }
    }

    /// Script a process exit (crash or normal).
    pub fn set_exited(&mut self, id: ProcessId) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.running = false;
        }
    }

    /// The most recently started process.
    pub fn last_started(&self) -> Option<ProcessId> {
        self.started.last().map(|(id, _)| *id)
    }
}

impl ProcessOrchestrator for ScriptedOrchestrator {
    fn start(&mut self, cmdline: &str, tag: &str) -> HarnessResult<ProcessId> {
        self.next_id += 1;
        let id = ProcessId(self.next_id);

        self.processes.insert(
            id,
            ScriptedProcess {
                queued_lines: VecDeque::new(),
                running: true,
                suspend_state: SuspendState::Active,
                memory: 0,
            },
        );
        self.started.push((id, cmdline.to_string()));
        tracing::debug!(tag, cmdline, ?id, "scripted process started");
        Ok(id)
    }

    fn is_running(&mut self, id: ProcessId) -> bool {
        self.processes.get(&id).map(|p| p.running).unwrap_or(false)
    }

    fn read_new_log_lines(&mut self, id: ProcessId) -> Vec<String> {
        self.processes
            .get_mut(&id)
            .and_then(|p| p.queued_lines.pop_front())
            .unwrap_or_default()
    }

    fn suspend(&mut self, id: ProcessId) -> HarnessResult<()> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(HarnessError::UnknownProcess { id })?;
        process.suspend_state = SuspendState::Suspended;
        Ok(())
    }

    fn resume(&mut self, id: ProcessId) -> HarnessResult<()> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(HarnessError::UnknownProcess { id })?;
        process.suspend_state = SuspendState::Active;
        Ok(())
    }

    fn suspend_state(&self, id: ProcessId) -> SuspendState {
        self.processes
            .get(&id)
            .map(|p| p.suspend_state)
            .unwrap_or_default()
    }

    fn terminate(&mut self, id: ProcessId) -> HarnessResult<()> {
        if let Some(process) = self.processes.get_mut(&id) {
            process.running = false;
        }
        Ok(())
    }

    fn memory_usage(&self, id: ProcessId) -> u64 {
        self.processes.get(&id).map(|p| p.memory).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_batches_arrive_in_order() {
        let mut orchestrator = ScriptedOrchestrator::new();
        let id = orchestrator.start("server -log", "Server").expect("start");

        orchestrator.push_log_batch(id, vec!["LogInit: booting".into()]);
        orchestrator.push_log_batch(id, vec!["Game Engine Initialized".into()]);

        assert_eq!(orchestrator.read_new_log_lines(id), vec!["LogInit: booting"]);
        assert_eq!(
            orchestrator.read_new_log_lines(id),
            vec!["Game Engine Initialized"]
        );
        assert!(orchestrator.read_new_log_lines(id).is_empty());
    }

    #[test]
    fn test_lifecycle() {
        let mut orchestrator = ScriptedOrchestrator::new();
        let id = orchestrator.start("server", "Server").expect("start");

        assert!(orchestrator.is_running(id));
        orchestrator.suspend(id).expect("suspend");
        assert_eq!(orchestrator.suspend_state(id), SuspendState::Suspended);
        orchestrator.resume(id).expect("resume");
        assert_eq!(orchestrator.suspend_state(id), SuspendState::Active);

        orchestrator.terminate(id).expect("terminate");
        assert!(!orchestrator.is_running(id));

        // Unknown processes answer conservatively
        assert!(!orchestrator.is_running(ProcessId(99)));
        assert_eq!(orchestrator.memory_usage(ProcessId(99)), 0);
    }

    #[test]
    fn test_scripted_memory() {
        let mut orchestrator = ScriptedOrchestrator::new();
        let id = orchestrator.start("server", "Server").expect("start");

        orchestrator.set_memory(id, 512 * 1024 * 1024);
        assert_eq!(orchestrator.memory_usage(id), 512 * 1024 * 1024);
    }
}
