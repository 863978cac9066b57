//! Tokio-backed process orchestrator.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::{HarnessError, HarnessResult};

use super::{ProcessId, ProcessOrchestrator, SuspendState};

struct LiveProcess {
    child: Child,
    tag: String,
    log_rx: mpsc::UnboundedReceiver<String>,
    suspend_state: SuspendState,
    terminated: bool,
}

/// Spawns real subprocesses and pumps their output.
///
/// Each child's stdout and stderr are read by background tasks feeding one
/// single-producer queue per process; [`read_new_log_lines`] drains it
/// without blocking, so per-probe logic never takes a lock.
///
/// Must be used from within a tokio `LocalSet` (the scheduler's runtime).
///
/// [`read_new_log_lines`]: ProcessOrchestrator::read_new_log_lines
#[derive(Default)]
pub struct LocalOrchestrator {
    processes: HashMap<ProcessId, LiveProcess>,
    next_id: u64,
}

impl LocalOrchestrator {
    /// Empty orchestrator.
    pub fn new() -> Self {
        Self::default()
    }

    fn process_mut(&mut self, id: ProcessId) -> HarnessResult<&mut LiveProcess> {
        self.processes
            .get_mut(&id)
            .ok_or(HarnessError::UnknownProcess { id })
    }

    #[cfg(unix)]
    fn signal(pid: u32, signal: &str) -> HarnessResult<()> {
        let status = std::process::Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .status()
            .map_err(HarnessError::Spawn)?;
        if status.success() {
            Ok(())
        } else {
            Err(HarnessError::Process {
                message: format!("kill {signal} {pid} exited with {status}"),
            })
        }
    }
}

impl ProcessOrchestrator for LocalOrchestrator {
    fn start(&mut self, cmdline: &str, tag: &str) -> HarnessResult<ProcessId> {
        let mut parts = cmdline.split_whitespace();
        let program = parts.next().ok_or_else(|| HarnessError::Process {
            message: "empty command line".to_string(),
        })?;

        tracing::info!(tag, cmdline, "starting process");

        let mut child = Command::new(program)
            .args(parts)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (log_tx, log_rx) = mpsc::unbounded_channel();

        if let Some(stdout) = child.stdout.take() {
            let tx = log_tx.clone();
            tokio::task::spawn_local(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::task::spawn_local(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if log_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        self.next_id += 1;
        let id = ProcessId(self.next_id);
        self.processes.insert(
            id,
            LiveProcess {
                child,
                tag: tag.to_string(),
                log_rx,
                suspend_state: SuspendState::Active,
                terminated: false,
            },
        );
        Ok(id)
    }

    fn is_running(&mut self, id: ProcessId) -> bool {
        match self.processes.get_mut(&id) {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn read_new_log_lines(&mut self, id: ProcessId) -> Vec<String> {
        let Some(process) = self.processes.get_mut(&id) else {
            return Vec::new();
        };

        let mut lines = Vec::new();
        while let Ok(line) = process.log_rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    fn suspend(&mut self, id: ProcessId) -> HarnessResult<()> {
        let process = self.process_mut(id)?;
        #[cfg(unix)]
        if let Some(pid) = process.child.id() {
            Self::signal(pid, "-STOP")?;
        }
        process.suspend_state = SuspendState::Suspended;
        tracing::info!(tag = %process.tag, "process suspended");
        Ok(())
    }

    fn resume(&mut self, id: ProcessId) -> HarnessResult<()> {
        let process = self.process_mut(id)?;
        #[cfg(unix)]
        if let Some(pid) = process.child.id() {
            Self::signal(pid, "-CONT")?;
        }
        process.suspend_state = SuspendState::Active;
        tracing::info!(tag = %process.tag, "process resumed");
        Ok(())
    }

    fn suspend_state(&self, id: ProcessId) -> SuspendState {
        self.processes
            .get(&id)
            .map(|p| p.suspend_state)
            .unwrap_or_default()
    }

    fn terminate(&mut self, id: ProcessId) -> HarnessResult<()> {
        let process = self.process_mut(id)?;
        if process.terminated {
            return Ok(());
        }
        process.terminated = true;

        tracing::info!(tag = %process.tag, "shutting down process");
        process.child.start_kill().map_err(|error| HarnessError::Process {
            message: format!("kill failed: {error}"),
        })
    }

    fn memory_usage(&self, id: ProcessId) -> u64 {
        let Some(process) = self.processes.get(&id) else {
            return 0;
        };
        match process.child.id() {
            Some(pid) => resident_bytes(pid),
            None => 0,
        }
    }
}

// statm field 1 is resident pages
#[cfg(target_os = "linux")]
fn resident_bytes(pid: u32) -> u64 {
    let Ok(statm) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
        return 0;
    };
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    resident_pages * 4096
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes(_pid: u32) -> u64 {
    0
}
