// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host metrics sampling, gated on players being online.
//!
//! The sampler is driven by the orchestrator's metrics timer. A tick with an
//! empty server produces nothing; otherwise it produces exactly one `metrics`
//! event. Fields that cannot be read are reported as `null` rather than
//! dropping the sample.

use crate::events::{EventKind, SessionState};
use chrono::{SecondsFormat, Utc};
use mc_metrics_collector::{hostname::get_hostname, CpuTimes, SystemStatsReader};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub load1: Option<f64>,
    pub hostname: String,
    /// RFC 3339 wall-clock time at which the sample was taken
    pub agent_time: String,
}

pub struct MetricsSampler {
    reader: Box<dyn SystemStatsReader>,
    hostname: String,
    /// CPU counters from the previous reading, used as the utilization baseline
    last_cpu: Option<CpuTimes>,
}

impl MetricsSampler {
    /// Creates a sampler and primes its CPU baseline, so the first sample
    /// already reports utilization since construction.
    pub fn new(reader: Box<dyn SystemStatsReader>) -> Self {
        Self::with_hostname(reader, get_hostname())
    }

    pub fn with_hostname(reader: Box<dyn SystemStatsReader>, hostname: String) -> Self {
        let last_cpu = reader.cpu_times();
        Self {
            reader,
            hostname,
            last_cpu,
        }
    }

    /// Handles one tick of the metrics timer.
    pub fn sample(&mut self, session: &SessionState) -> Option<EventKind> {
        if !session.has_players() {
            debug!("No players online, skipping metrics sample");
            return None;
        }

        Some(EventKind::Metrics {
            metrics: self.snapshot(),
            players_online: session.players_online(),
        })
    }

    fn snapshot(&mut self) -> MetricsSnapshot {
        let current = self.reader.cpu_times();
        let cpu_pct = match (current, self.last_cpu) {
            (Some(current), Some(last)) => current.utilization_since(&last),
            _ => None,
        };
        if current.is_some() {
            self.last_cpu = current;
        }

        MetricsSnapshot {
            cpu_pct,
            mem_pct: self.reader.memory_used_pct(),
            load1: self.reader.load1(),
            hostname: self.hostname.clone(),
            agent_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
