// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host statistics reader for Linux.
//!
//! Reads the host-wide counters from the `/proc` filesystem:
//!
//! ```text
//! /proc/stat     - cumulative CPU ticks ("cpu  user nice system idle iowait irq softirq steal ...")
//! /proc/meminfo  - memory totals in kB (MemTotal, MemAvailable, ...)
//! /proc/loadavg  - load averages ("0.52 0.58 0.59 1/467 12345")
//! ```

use crate::stats::{CpuTimes, SystemStatsReader};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const PROC_ROOT: &str = "/proc";

pub struct ProcStatsReader {
    root: PathBuf,
}

impl Default for ProcStatsReader {
    fn default() -> Self {
        Self {
            root: PathBuf::from(PROC_ROOT),
        }
    }
}

impl ProcStatsReader {
    /// Creates a reader over a directory laid out like `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, file: &str) -> Option<String> {
        let path = self.root.join(file);
        match fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(e) => {
                debug!("Could not read {}: {e}", path.display());
                None
            }
        }
    }
}

impl SystemStatsReader for ProcStatsReader {
    fn cpu_times(&self) -> Option<CpuTimes> {
        let times = parse_proc_stat(&self.read("stat")?);
        if times.is_none() {
            debug!("Failed to parse aggregate cpu line from /proc/stat");
        }
        times
    }

    fn memory_used_pct(&self) -> Option<f64> {
        let pct = parse_meminfo(&self.read("meminfo")?);
        if pct.is_none() {
            debug!("Failed to parse memory totals from /proc/meminfo");
        }
        pct
    }

    fn load1(&self) -> Option<f64> {
        parse_loadavg(&self.read("loadavg")?)
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
///
/// The first eight columns are user, nice, system, idle, iowait, irq, softirq
/// and steal. Guest time is already folded into user/nice, so it is skipped.
/// Idle and iowait count as not busy.
pub fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))?;

    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    // Kernels older than 2.6.11 report fewer columns; user, nice, system and idle are always there
    if values.len() < 4 {
        return None;
    }

    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Parses `/proc/meminfo` into the percentage of memory in use.
///
/// Uses `MemAvailable` when present and falls back to
/// `MemFree + Buffers + Cached` for kernels that do not report it.
pub fn parse_meminfo(contents: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    let mut buffers = None;
    let mut cached = None;

    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = Some(value),
            "MemAvailable:" => available = Some(value),
            "MemFree:" => free = Some(value),
            "Buffers:" => buffers = Some(value),
            "Cached:" => cached = Some(value),
            _ => {}
        }
    }

    let total = total.filter(|t| *t > 0)?;
    let available = match available {
        Some(available) => available,
        None => free? + buffers.unwrap_or(0) + cached.unwrap_or(0),
    };
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

/// Parses the one-minute load average from `/proc/loadavg`.
pub fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse::<f64>().ok()
}
