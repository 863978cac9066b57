//! Environment profiles.
//!
//! A profile describes the target game environment: which map to load for a
//! given flag set, stock server parameters, and the log line fragments that
//! signal server startup progress. Probes never hard-code these; the
//! scheduler threads one profile through every launch.

use gauntlet_conn::HarnessFlags;

/// Server log fragments grouped by what they signal.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatterns {
    /// Startup is progressing; reset the probe timeout.
    pub start_progress: Vec<String>,
    /// The server is ready; the fake client may connect.
    pub ready: Vec<String>,
    /// Long-running server work; reset the connection timeout too.
    pub timeout_reset: Vec<String>,
}

/// Collaborator contract for a target environment.
pub trait EnvironmentProfile {
    /// Environment name, matched against descriptor expectations.
    fn name(&self) -> &str;

    /// Default map for a probe's flag set.
    fn default_map(&self, flags: HarnessFlags) -> String;

    /// Stock server launch parameters.
    fn default_server_parameters(&self) -> String;

    /// Log fragments signalling server startup progress.
    fn server_progress_log_patterns(&self) -> ProgressPatterns;
}

/// The stock environment profile.
#[derive(Debug, Default, Clone)]
pub struct StandardEnvironment;

impl EnvironmentProfile for StandardEnvironment {
    fn name(&self) -> &str {
        "standard"
    }

    fn default_map(&self, flags: HarnessFlags) -> String {
        if flags.contains(HarnessFlags::BEACON_CONNECT) {
            "EntryMap".to_string()
        } else {
            "TestArena".to_string()
        }
    }

    fn default_server_parameters(&self) -> String {
        "-server -log -unattended -forcelogflush -stdout".to_string()
    }

    fn server_progress_log_patterns(&self) -> ProgressPatterns {
        ProgressPatterns {
            start_progress: vec![
                "LogInit:".to_string(),
                "LogLoad: Loading map".to_string(),
                "Bringing World".to_string(),
            ],
            ready: vec![
                "Game Engine Initialized".to_string(),
                "Match State Changed from EnteringMap".to_string(),
            ],
            timeout_reset: vec!["NotifyAcceptingConnection accepted from".to_string()],
        }
    }
}
