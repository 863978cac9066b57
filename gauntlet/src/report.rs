//! Per-probe result records and the final summary.
//!
//! Every probe run produces exactly one structured record: expected versus
//! actual verification state plus annotations. The final summary groups
//! unsupported, aborted and completed probes separately.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use gauntlet_conn::VerificationState;

/// Structured result of one finished probe run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    /// Probe name.
    pub name: String,
    /// Expected outcome for the target environment, when configured.
    pub expected: Option<VerificationState>,
    /// Actual recorded outcome.
    pub actual: VerificationState,
    /// The run was aborted (by eviction or request).
    pub aborted: bool,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// First run with no prior memory statistics.
    pub first_time_stats: bool,
}

impl ProbeRecord {
    /// Whether the probe produced the outcome its descriptor expects.
    pub fn matches_expected(&self) -> bool {
        self.expected == Some(self.actual)
    }

    /// Log this record, the way a completion is reported.
    pub fn log(&self) {
        tracing::info!(probe = %self.name, "probe completed:");
        tracing::info!(probe = %self.name, "  - result: {:?}", self.actual);
        tracing::info!(probe = %self.name, "  - execution time: {:?}", self.duration);

        match self.expected {
            None => {
                tracing::error!(probe = %self.name, "  - probe does not have an expected result set");
            }
            Some(expected) if expected == self.actual => {
                if self.actual == VerificationState::VerifiedFixed {
                    tracing::info!(probe = %self.name, "  - probe issue has been fixed");
                } else if self.actual == VerificationState::VerifiedUnreliable {
                    tracing::warn!(
                        probe = %self.name,
                        "  - probe expected to be unreliable, multiple runs may not change the outcome"
                    );
                }
            }
            Some(_) => {
                if self.actual == VerificationState::VerifiedNeedsUpdate {
                    tracing::warn!(probe = %self.name, "  - probe returned 'needs update' as its result");
                } else {
                    tracing::warn!(
                        probe = %self.name,
                        "  - probe did not return the expected result and needs an update"
                    );
                }
                if self.actual == VerificationState::VerifiedUnreliable {
                    tracing::warn!(
                        probe = %self.name,
                        "  - probe marked unreliable, may need multiple runs for the expected result"
                    );
                }
            }
        }
    }
}

/// Grouped results of a whole scheduler run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FinalSummary {
    /// Probes that do not support the target environment, with the reason.
    pub unsupported: Vec<(String, String)>,
    /// Abort counts per probe name.
    pub aborted: HashMap<String, u32>,
    /// Completed probe records.
    pub completed: Vec<ProbeRecord>,
}

impl FinalSummary {
    /// Number of completed probes whose outcome matched expectations.
    pub fn matched(&self) -> usize {
        self.completed.iter().filter(|r| r.matches_expected()).count()
    }

    /// Whether every completed probe matched its expected outcome.
    pub fn all_matched(&self) -> bool {
        self.matched() == self.completed.len()
    }
}

impl fmt::Display for FinalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Final Probe Summary ===")?;

        for (name, reason) in &self.unsupported {
            writeln!(f, "{name}: {reason}")?;
        }

        let mut aborted: Vec<_> = self.aborted.iter().collect();
        aborted.sort();
        for (name, count) in aborted {
            if *count == 1 {
                writeln!(f, "{name}: Aborted.")?;
            } else {
                writeln!(f, "{name}: Aborted ('{count}' times).")?;
            }
        }

        for record in &self.completed {
            writeln!(f, "{}:", record.name)?;
            writeln!(f, "  - Result: {:?}", record.actual)?;
            match record.expected {
                Some(expected) if record.matches_expected() => {
                    writeln!(f, "  - Expected: {expected:?} (matched)")?;
                }
                Some(expected) => {
                    writeln!(f, "  - Expected: {expected:?} (NOT matched - needs update)")?;
                }
                None => {
                    writeln!(f, "  - Expected: unset")?;
                }
            }
            writeln!(f, "  - Execution Time: {:?}", record.duration)?;
        }

        writeln!(
            f,
            "Completed: {} ({} matching expectations)",
            self.completed.len(),
            self.matched()
        )?;

        Ok(())
    }
}
