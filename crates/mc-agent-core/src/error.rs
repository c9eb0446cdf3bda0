// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ConfigError;
use crate::queue::QueueError;

/// Errors that stop the agent.
///
/// Transient conditions (missing log file, failed deliveries) never surface
/// here; they are logged and retried.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Delivery queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Drain task failed: {0}")]
    DrainTask(String),
}

impl AgentError {
    /// Configuration problems are reported before the run loop starts.
    pub fn is_config(&self) -> bool {
        match self {
            AgentError::Config(_) => true,
            AgentError::Queue(QueueError::NotWritable { .. }) => true,
            _ => false,
        }
    }
}
