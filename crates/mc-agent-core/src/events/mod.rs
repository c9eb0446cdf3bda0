// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Domain events produced by the agent.
//!
//! Wire form, one JSON object per event:
//!
//! ```text
//! {"server_id":"minecraft-01","ts":1718000000,"event":"player_joined","player":"Steve","players_online":1}
//! ```

pub mod extractor;

use crate::clock;
use crate::metrics::MetricsSnapshot;
use serde::{Deserialize, Serialize};

pub use extractor::{EventExtractor, ServerPhase, SessionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub server_id: String,
    /// Unix seconds at which the event was created
    pub ts: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(server_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            server_id: server_id.into(),
            ts: clock::unix_secs(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    ServerStarted {
        origin: StartOrigin,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        startup_secs: Option<f64>,
    },
    PlayerJoined {
        player: String,
        players_online: usize,
    },
    PlayerLeft {
        player: String,
        players_online: usize,
    },
    Metrics {
        metrics: MetricsSnapshot,
        players_online: usize,
    },
    ServerStopped,
    ServerCrashed {
        /// The log line that identified the crash
        signature: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ServerStarted { .. } => "server_started",
            EventKind::PlayerJoined { .. } => "player_joined",
            EventKind::PlayerLeft { .. } => "player_left",
            EventKind::Metrics { .. } => "metrics",
            EventKind::ServerStopped => "server_stopped",
            EventKind::ServerCrashed { .. } => "server_crashed",
        }
    }
}

/// What announced a server start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOrigin {
    /// The agent itself came up next to the server
    AgentBoot,
    /// The server logged that it finished starting
    ServerLog,
}
