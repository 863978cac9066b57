//! Crash detection over subprocess log output.
//!
//! Servers run out-of-process, so the only crash signal is their log
//! stream. The monitor walks a small stage machine over incoming lines:
//! an error-start marker opens the capture, description lines follow,
//! callstack lines are recognized by shape, and everything after the
//! callstack is exit noise.

use regex::Regex;

/// Where in a crash log the monitor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorLogStage {
    /// No crash detected.
    #[default]
    NoError,
    /// An error-start marker just matched.
    ErrorStart,
    /// Capturing the error description.
    ErrorDesc,
    /// Capturing callstack lines.
    ErrorCallstack,
    /// Past the callstack; trailing exit output.
    ErrorExit,
}

/// One captured crash log line.
#[derive(Debug, Clone)]
pub struct ErrorLine {
    /// Stage the line was captured in.
    pub stage: ErrorLogStage,
    /// The raw line.
    pub line: String,
}

/// Stage machine scanning a process's log lines for a crash.
pub struct CrashMonitor {
    stage: ErrorLogStage,
    captured: Vec<ErrorLine>,
    start_markers: Vec<String>,
    callstack_pattern: Regex,
}

impl Default for CrashMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashMonitor {
    /// Monitor with the stock error-start markers.
    pub fn new() -> Self {
        Self {
            stage: ErrorLogStage::NoError,
            captured: Vec::new(),
            start_markers: vec![
                "=== Critical error: ===".to_string(),
                "Fatal error!".to_string(),
                "Windows GetLastError:".to_string(),
            ],
            // Matches: " (0x000007fefe22cacd) + 0 bytes ["
            callstack_pattern: Regex::new(r"\s\(0x[0-9a-f]+\) \+ [0-9]+ bytes \[")
                .expect("static pattern"),
        }
    }

    /// Whether a crash has been detected.
    pub fn crashed(&self) -> bool {
        self.stage != ErrorLogStage::NoError
    }

    /// Current stage.
    pub fn stage(&self) -> ErrorLogStage {
        self.stage
    }

    /// Captured crash lines, description first.
    pub fn captured(&self) -> &[ErrorLine] {
        &self.captured
    }

    /// The description lines of the crash, for summary printing.
    pub fn description_lines(&self) -> Vec<&str> {
        self.captured
            .iter()
            .filter(|l| l.stage == ErrorLogStage::ErrorDesc)
            .map(|l| l.line.as_str())
            .collect()
    }

    /// Scan a batch of log lines.
    ///
    /// Returns true when this batch contained the start of a crash (useful
    /// for resetting timeouts: callstack dumps can take a long time).
    pub fn scan(&mut self, lines: &[String]) -> bool {
        let mut started_here = false;

        for line in lines {
            let is_start_marker = self.start_markers.iter().any(|m| line.contains(m));

            if self.stage == ErrorLogStage::NoError {
                if is_start_marker {
                    self.stage = ErrorLogStage::ErrorStart;
                    started_here = true;
                } else {
                    continue;
                }
            }

            // Description begins with the first non-marker line
            if self.stage == ErrorLogStage::ErrorStart && !is_start_marker {
                self.stage = ErrorLogStage::ErrorDesc;
            }

            if matches!(self.stage, ErrorLogStage::ErrorDesc | ErrorLogStage::ErrorCallstack) {
                if self.callstack_pattern.is_match(line) {
                    self.stage = ErrorLogStage::ErrorCallstack;
                } else if self.stage == ErrorLogStage::ErrorCallstack {
                    self.stage = ErrorLogStage::ErrorExit;
                }
            }

            self.captured.push(ErrorLine {
                stage: self.stage,
                line: line.clone(),
            });
        }

        started_here
    }
}
