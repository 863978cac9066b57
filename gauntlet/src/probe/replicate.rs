//! Debug replication machine.
//!
//! Sanity-checks the replication path end to end: summon the marker actor,
//! register a watched event, and wait for the server's notification to
//! come back through the control channel.

use std::time::Duration;

use gauntlet_conn::{FakeClient, VerificationState};
use gauntlet_wire::{ControlMessage, HarnessCmd};

/// Round-trips a marker actor and a watched event.
pub struct DebugReplicate {
    watch_event: String,
    sent: bool,
}

impl DebugReplicate {
    /// Machine watching for `watch_event`.
    pub fn new(watch_event: impl Into<String>) -> Self {
        Self {
            watch_event: watch_event.into(),
            sent: false,
        }
    }

    /// Summon the marker actor and register the watch. Runs once.
    pub fn execute(&mut self, client: &mut FakeClient, now: Duration) {
        if self.sent {
            return;
        }
        self.sent = true;

        let sends = [
            ControlMessage::Harness(HarnessCmd::Summon, "MarkerActor".into()),
            ControlMessage::Harness(HarnessCmd::WatchEvent, self.watch_event.clone()),
        ];
        for message in sends {
            if let Err(error) = client.send_control_message(&message, now) {
                tracing::warn!(%error, "debug replicate send failed");
                return;
            }
        }
    }

    /// Feed a decoded control message.
    pub fn on_control(&mut self, message: &ControlMessage) -> Option<VerificationState> {
        match message {
            ControlMessage::Harness(HarnessCmd::NotifyEvent, event) if self.sent => {
                if event == &self.watch_event {
                    tracing::info!(event = %event, "watched event replicated back");
                    Some(VerificationState::VerifiedFixed)
                } else {
                    tracing::warn!(event = %event, "notification for an unwatched event");
                    Some(VerificationState::VerifiedNeedsUpdate)
                }
            }
            _ => None,
        }
    }
}
