//! Exploit replay machine.
//!
//! Replays a scripted sequence of raw frames and control commands against
//! the server, then watches its log for one of two markers: the line
//! proving the exploit still reproduces, or the line proving the server now
//! rejects it. A server crash during the replay counts as a reproduction
//! when the probe declared it expects one.

use std::time::Duration;

use gauntlet_conn::{FakeClient, VerificationState};
use gauntlet_wire::{ControlMessage, HarnessCmd};

use crate::descriptor::ReplayStep;

/// Scripted exploit replay.
pub struct ExploitReplay {
    steps: Vec<ReplayStep>,
    fixed_pattern: Option<String>,
    repro_pattern: Option<String>,
    sent: bool,
}

impl ExploitReplay {
    /// Machine for a replay script and its outcome patterns.
    pub fn new(
        steps: Vec<ReplayStep>,
        fixed_pattern: Option<String>,
        repro_pattern: Option<String>,
    ) -> Self {
        Self {
            steps,
            fixed_pattern,
            repro_pattern,
            sent: false,
        }
    }

    /// Whether the script has been sent.
    pub fn sent(&self) -> bool {
        self.sent
    }

    /// Send the whole script. Runs once; later calls are no-ops.
    pub fn execute(&mut self, client: &mut FakeClient, now: Duration) {
        if self.sent {
            return;
        }
        self.sent = true;

        for step in &self.steps {
            let result = match step {
                ReplayStep::Raw(bytes) => client.send_raw(bytes, now).map(|_| ()),
                ReplayStep::Control { cmd, arg } => match HarnessCmd::from_byte(*cmd) {
                    Ok(cmd) => client
                        .send_control_message(&ControlMessage::Harness(cmd, arg.clone()), now)
                        .map(|_| ()),
                    Err(error) => {
                        tracing::warn!(%error, "skipping replay step with bad command");
                        Ok(())
                    }
                },
            };

            if let Err(error) = result {
                tracing::warn!(%error, "replay step failed to send");
                return;
            }
        }

        tracing::info!(steps = self.steps.len(), "exploit script replayed");
    }

    /// Feed one server log line.
    pub fn on_server_log(&mut self, line: &str) -> Option<VerificationState> {
        if !self.sent {
            return None;
        }

        if let Some(pattern) = &self.repro_pattern {
            if line.contains(pattern.as_str()) {
                tracing::warn!(line, "exploit reproduced");
                return Some(VerificationState::VerifiedNotFixed);
            }
        }

        if let Some(pattern) = &self.fixed_pattern {
            if line.contains(pattern.as_str()) {
                tracing::info!(line, "server rejected the exploit");
                return Some(VerificationState::VerifiedFixed);
            }
        }

        None
    }

    /// The server crashed while the script was outstanding.
    pub fn on_server_crash(&mut self, expected: bool) -> VerificationState {
        if expected && self.sent {
            VerificationState::VerifiedNotFixed
        } else {
            VerificationState::VerifiedNeedsUpdate
        }
    }
}
