// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod hostname;
pub mod stats;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(not(target_os = "linux"))]
pub mod unsupported;

pub use stats::{CpuTimes, SystemStatsReader};

/// Returns the reader for the platform the agent was compiled for.
#[cfg(target_os = "linux")]
pub fn default_reader() -> Box<dyn SystemStatsReader> {
    Box::new(linux::ProcStatsReader::default())
}

/// Returns the reader for the platform the agent was compiled for.
#[cfg(not(target_os = "linux"))]
pub fn default_reader() -> Box<dyn SystemStatsReader> {
    Box::new(unsupported::UnsupportedStatsReader)
}
