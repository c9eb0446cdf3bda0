// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::stats::{CpuTimes, SystemStatsReader};
use tracing::debug;

pub struct UnsupportedStatsReader;

impl SystemStatsReader for UnsupportedStatsReader {
    fn cpu_times(&self) -> Option<CpuTimes> {
        debug!("CPU stats are not supported on this platform");
        None
    }

    fn memory_used_pct(&self) -> Option<f64> {
        None
    }

    fn load1(&self) -> Option<f64> {
        None
    }
}
