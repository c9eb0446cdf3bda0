// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host statistics shared by every platform reader.
//!
//! Readers return `None` for anything they cannot read. Callers are expected
//! to report a missing field rather than drop the whole sample.

/// Cumulative CPU time counters, in clock ticks, summed over all cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// Ticks spent doing work (user, nice, system, irq, softirq, steal)
    pub busy: u64,
    /// All ticks, including idle and iowait
    pub total: u64,
}

impl CpuTimes {
    /// CPU utilization in percent between an earlier reading and this one.
    ///
    /// Returns `None` if no time elapsed between the readings or the counters
    /// went backwards (e.g. a reset after suspend).
    pub fn utilization_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total_delta = self.total.checked_sub(earlier.total)?;
        let busy_delta = self.busy.checked_sub(earlier.busy)?;
        if total_delta == 0 {
            return None;
        }
        let pct = busy_delta as f64 / total_delta as f64 * 100.0;
        Some(pct.clamp(0.0, 100.0))
    }
}

pub trait SystemStatsReader: Send + Sync {
    /// Reads the current cumulative CPU counters.
    fn cpu_times(&self) -> Option<CpuTimes>;
    /// Reads memory in use as a percentage of total memory.
    fn memory_used_pct(&self) -> Option<f64>;
    /// Reads the one-minute load average.
    fn load1(&self) -> Option<f64>;
}
