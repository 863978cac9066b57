//! Memory accounting and admission projection.
//!
//! Admission is not just "is there memory free right now": the scheduler
//! predicts future usage. Every instance's previous run recorded its peak
//! memory and how long it took to get there; usage ramps linearly from zero
//! to that peak over that window. For each active-or-candidate instance the
//! scheduler estimates system-wide usage at the moment *that* instance hits
//! its own peak, and admits only if the worst of those projections stays
//! under the limit.

use std::time::Duration;

/// Ramps shorter than this are treated as unknown; the instance counts at
/// full peak from the start.
const MIN_KNOWN_RAMP: Duration = Duration::from_millis(500);

/// Source of system physical memory numbers.
pub trait MemoryProbe {
    /// Total physical memory in bytes.
    fn total_physical(&self) -> u64;

    /// Physical memory currently in use, in bytes.
    fn used_physical(&self) -> u64;
}

/// Reads `/proc/meminfo`. Non-Linux platforms report zero, which disables
/// memory-based admission.
#[derive(Debug, Default, Clone)]
pub struct ProcMemory;

impl ProcMemory {
    fn read_kib(field: &str) -> u64 {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return 0;
        };
        meminfo
            .lines()
            .find(|line| line.starts_with(field))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

impl MemoryProbe for ProcMemory {
    fn total_physical(&self) -> u64 {
        Self::read_kib("MemTotal:") * 1024
    }

    fn used_physical(&self) -> u64 {
        let total = Self::read_kib("MemTotal:");
        let available = Self::read_kib("MemAvailable:");
        total.saturating_sub(available) * 1024
    }
}

/// Fixed numbers for deterministic tests.
///
/// Clones share the usage cell, so a test can keep a handle and move the
/// reported number while the scheduler owns its copy.
#[derive(Debug, Clone)]
pub struct FixedMemory {
    total: u64,
    used: std::rc::Rc<std::cell::Cell<u64>>,
}

impl FixedMemory {
    /// Probe reporting `total` bytes physical and `used` bytes in use.
    pub fn new(total: u64, used: u64) -> Self {
        Self {
            total,
            used: std::rc::Rc::new(std::cell::Cell::new(used)),
        }
    }

    /// Change the reported usage.
    pub fn set_used(&self, used: u64) {
        self.used.set(used);
    }
}

impl MemoryProbe for FixedMemory {
    fn total_physical(&self) -> u64 {
        self.total
    }

    fn used_physical(&self) -> u64 {
        self.used.get()
    }
}

/// Per-instance memory statistics, fed by process polling.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    /// When the instance started.
    pub start_time: Duration,
    /// Memory currently attributed to the instance.
    pub current: u64,
    /// Highest usage observed (seeded from the previous run).
    pub peak: u64,
    /// Time from start to (90% of) peak, best known.
    pub time_to_peak: Duration,
    /// No previous-run stats existed for this probe.
    pub first_time: bool,
}

impl MemoryStats {
    /// Stats for an instance starting at `start_time`, seeded with the
    /// previous run's `(peak, time_to_peak)` when one exists.
    pub fn new(start_time: Duration, prior: Option<(u64, Duration)>) -> Self {
        match prior {
            Some((peak, time_to_peak)) => Self {
                start_time,
                current: 0,
                peak,
                time_to_peak,
                first_time: false,
            },
            None => Self {
                start_time,
                current: 0,
                peak: 0,
                time_to_peak: Duration::ZERO,
                first_time: true,
            },
        }
    }

    /// Record a memory sample.
    ///
    /// A new peak resets the time-to-peak; reaching 90% of the known peak
    /// faster than before tightens it.
    pub fn update(&mut self, now: Duration, usage: u64) {
        if usage == 0 {
            return;
        }
        self.current = usage;

        let running = now.saturating_sub(self.start_time);
        if usage > self.peak {
            self.peak = usage;
            self.time_to_peak = running;
        } else if running < self.time_to_peak && usage.saturating_mul(100) >= self.peak.saturating_mul(90)
        {
            self.time_to_peak = running;
        }
    }

    /// Projection inputs for admission math.
    pub fn projection(&self) -> InstanceProjection {
        InstanceProjection {
            start_time: self.start_time,
            time_to_peak: self.time_to_peak,
            peak: self.peak,
            current: self.current,
        }
    }
}

/// The numbers admission needs from one active-or-candidate instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceProjection {
    /// When the instance started (candidates: now).
    pub start_time: Duration,
    /// Previously observed time to peak memory.
    pub time_to_peak: Duration,
    /// Previously observed peak memory, bytes.
    pub peak: u64,
    /// Memory currently attributed to the instance.
    pub current: u64,
}

impl InstanceProjection {
    fn peak_time(&self) -> Duration {
        self.start_time + self.time_to_peak
    }
}

/// Estimated memory an instance uses at `target` time.
///
/// Linear interpolation from zero to peak over the instance's ramp; past
/// the ramp (or with an unknown ramp) the full peak counts.
pub fn usage_at(instance: &InstanceProjection, target: Duration) -> u64 {
    if instance.time_to_peak < MIN_KNOWN_RAMP {
        return instance.peak;
    }

    let peak_time = instance.peak_time();
    if target >= peak_time {
        return instance.peak;
    }
    if target <= instance.start_time {
        return 0;
    }

    let elapsed = (target - instance.start_time).as_secs_f64();
    let ramp = instance.time_to_peak.as_secs_f64();
    (instance.peak as f64 * (elapsed / ramp)) as u64
}

/// Worst-case combined usage across all instances.
///
/// The worst case is the maximum, over every instance, of the combined
/// usage at the moment that instance hits its own peak.
pub fn worst_case_total(instances: &[InstanceProjection]) -> u64 {
    instances
        .iter()
        .map(|pivot| {
            let at = pivot.peak_time();
            instances.iter().map(|other| usage_at(other, at)).sum()
        })
        .max()
        .unwrap_or(0)
}

/// Projected system-wide peak: replace the instances' current footprint in
/// the live number with their worst-case combined projection.
pub fn projected_system_peak(used_physical: u64, instances: &[InstanceProjection]) -> u64 {
    let current_total: u64 = instances.iter().map(|i| i.current).sum();
    used_physical.saturating_sub(current_total) + worst_case_total(instances)
}
