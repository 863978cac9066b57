//! Probe descriptors.
//!
//! A descriptor is the static configuration of one probe type: which
//! protocol events get intercepted, what outcome each target environment is
//! expected to produce, how long the run may take, and whether the probe is
//! allowed to crash the server on purpose. Suites are serde-loadable so a
//! probe list can live in a JSON file next to the harness.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gauntlet_conn::{validate_flags, HarnessFlags, VerificationState};
use gauntlet_wire::HarnessCmd;

use crate::error::{HarnessError, HarnessResult};

/// Closed set of probe behavior variants.
///
/// Dispatch is on this tag; there is no probe class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeKind {
    /// Packet-size probe through the raw transport path only.
    LowLevelProbe,
    /// Packet-size probe through both the raw and the bunch/channel paths.
    BunchProbe,
    /// Replay a scripted exploit sequence and watch the server's reaction.
    ExploitReplay,
    /// Round-trip a marker actor and a watched event through replication.
    DebugReplicate,
}

/// One step of an exploit replay script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayStep {
    /// Push raw bytes straight at the socket layer.
    Raw(Vec<u8>),
    /// Send a harness control command.
    Control {
        /// Sub-command to send.
        cmd: u8,
        /// String argument.
        arg: String,
    },
}

impl ReplayStep {
    /// Decode the control step's command byte.
    pub fn harness_cmd(&self) -> Option<HarnessCmd> {
        match self {
            ReplayStep::Control { cmd, .. } => HarnessCmd::from_byte(*cmd).ok(),
            ReplayStep::Raw(_) => None,
        }
    }
}

/// Static configuration for one probe type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    /// Unique probe name.
    pub name: String,
    /// Behavior variant.
    pub kind: ProbeKind,
    /// Event interception and requirement bits.
    pub flags: HarnessFlags,
    /// Run timeout in seconds.
    pub timeout_secs: u64,
    /// Expected outcome per target environment name.
    #[serde(default)]
    pub expected: HashMap<String, VerificationState>,
    /// Environments this probe supports. Empty means all.
    #[serde(default)]
    pub supported_environments: Vec<String>,
    /// Unfinished probe: debug-only flags allowed, excluded from `all` runs.
    #[serde(default)]
    pub work_in_progress: bool,
    /// Extra server launch parameters.
    #[serde(default)]
    pub server_parameters: Option<String>,
    /// Beacon type for `BEACON_CONNECT` probes.
    #[serde(default)]
    pub beacon_type: Option<String>,
    /// Replay script for `ExploitReplay` probes.
    #[serde(default)]
    pub replay: Vec<ReplayStep>,
    /// Server log line proving the issue is fixed.
    #[serde(default)]
    pub fixed_pattern: Option<String>,
    /// Server log line proving the issue still reproduces.
    #[serde(default)]
    pub repro_pattern: Option<String>,
}

impl ProbeDescriptor {
    /// Minimal descriptor with the mandatory server launch flag.
    pub fn new(name: impl Into<String>, kind: ProbeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            flags: HarnessFlags::LAUNCH_SERVER,
            timeout_secs: 60,
            expected: HashMap::new(),
            supported_environments: Vec::new(),
            work_in_progress: false,
            server_parameters: None,
            beacon_type: None,
            replay: Vec::new(),
            fixed_pattern: None,
            repro_pattern: None,
        }
    }

    /// Run timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Expected outcome for an environment, if configured.
    pub fn expected_for(&self, environment: &str) -> Option<VerificationState> {
        self.expected.get(environment).copied()
    }

    /// Whether this probe supports `environment`.
    pub fn supports(&self, environment: &str) -> bool {
        self.supported_environments.is_empty()
            || self.supported_environments.iter().any(|e| e == environment)
    }

    /// Validate flag rules and kind-specific requirements.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDescriptor` naming the violated rule.
    pub fn validate(&self) -> HarnessResult<()> {
        let invalid = |reason: &str| HarnessError::InvalidDescriptor {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("empty name"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("zero timeout"));
        }

        validate_flags(self.flags, self.work_in_progress).map_err(|error| {
            HarnessError::InvalidDescriptor {
                name: self.name.clone(),
                reason: error.to_string(),
            }
        })?;

        match self.kind {
            ProbeKind::ExploitReplay => {
                if self.replay.is_empty() {
                    return Err(invalid("exploit replay without a script"));
                }
                if self.fixed_pattern.is_none() && self.repro_pattern.is_none() {
                    return Err(invalid("exploit replay without outcome patterns"));
                }
                for step in &self.replay {
                    if let ReplayStep::Control { cmd, .. } = step {
                        if HarnessCmd::from_byte(*cmd).is_err() {
                            return Err(invalid("replay step with unknown command byte"));
                        }
                    }
                }
            }
            ProbeKind::DebugReplicate => {
                if !self.flags.contains(HarnessFlags::REQUIRE_MARKER_ACTOR) {
                    return Err(invalid("debug replicate requires the marker actor"));
                }
            }
            ProbeKind::LowLevelProbe | ProbeKind::BunchProbe => {}
        }

        if self.flags.contains(HarnessFlags::BEACON_CONNECT) && self.beacon_type.is_none() {
            return Err(invalid("beacon connect without a beacon type"));
        }

        Ok(())
    }

    /// Load a probe suite from JSON.
    pub fn load_suite(json: &str) -> HarnessResult<Vec<ProbeDescriptor>> {
        let suite: Vec<ProbeDescriptor> = serde_json::from_str(json)?;
        for descriptor in &suite {
            descriptor.validate()?;
        }
        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_descriptor_valid() {
        ProbeDescriptor::new("packet-limit", ProbeKind::BunchProbe)
            .validate()
            .expect("valid");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut descriptor = ProbeDescriptor::new("p", ProbeKind::LowLevelProbe);
        descriptor.timeout_secs = 0;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_exploit_replay_needs_script_and_patterns() {
        let mut descriptor = ProbeDescriptor::new("exploit", ProbeKind::ExploitReplay);
        assert!(descriptor.validate().is_err());

        descriptor.replay.push(ReplayStep::Raw(vec![0xFF; 8]));
        assert!(descriptor.validate().is_err());

        descriptor.repro_pattern = Some("Corrupt data found".into());
        descriptor.validate().expect("valid");
    }

    #[test]
    fn test_exploit_replay_rejects_unknown_command() {
        let mut descriptor = ProbeDescriptor::new("exploit", ProbeKind::ExploitReplay);
        descriptor.replay.push(ReplayStep::Control {
            cmd: 250,
            arg: String::new(),
        });
        descriptor.repro_pattern = Some("x".into());
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_debug_replicate_needs_marker_actor() {
        let mut descriptor = ProbeDescriptor::new("replicate", ProbeKind::DebugReplicate);
        assert!(descriptor.validate().is_err());

        descriptor.flags |= HarnessFlags::ACCEPT_ACTORS
            | HarnessFlags::NOTIFY_NET_ACTORS
            | HarnessFlags::REQUIRE_MARKER_ACTOR;
        descriptor.validate().expect("valid");
    }

    #[test]
    fn test_environment_support() {
        let mut descriptor = ProbeDescriptor::new("p", ProbeKind::LowLevelProbe);
        assert!(descriptor.supports("standard"));

        descriptor.supported_environments = vec!["arena".into()];
        assert!(descriptor.supports("arena"));
        assert!(!descriptor.supports("standard"));
    }

    #[test]
    fn test_suite_roundtrip() {
        let mut descriptor = ProbeDescriptor::new("packet-limit", ProbeKind::BunchProbe);
        descriptor
            .expected
            .insert("standard".into(), VerificationState::VerifiedFixed);

        let json = serde_json::to_string(&vec![descriptor.clone()]).expect("serialize");
        let suite = ProbeDescriptor::load_suite(&json).expect("suite");

        assert_eq!(suite.len(), 1);
        assert_eq!(suite[0].name, "packet-limit");
        assert_eq!(
            suite[0].expected_for("standard"),
            Some(VerificationState::VerifiedFixed)
        );
        assert_eq!(suite[0].expected_for("arena"), None);
    }
}
