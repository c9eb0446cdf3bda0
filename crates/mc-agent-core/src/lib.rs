// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Minecraft server agent
//!
//! Watches a Minecraft server's `latest.log`, turns recognizable lines into
//! lifecycle and player events, samples host metrics while players are
//! online, signs every event with a pre-shared HMAC key and delivers it to an
//! ingest endpoint through a crash-safe on-disk queue.
//!
//! - [`tail`]: rotation-aware polling of the log file
//! - [`events`]: event types and the line classifier
//! - [`metrics`]: player-gated host metrics
//! - [`signer`]: envelopes and HMAC-SHA256 signatures
//! - [`queue`]: durable spool, backoff and the drain loop
//! - [`sink`]: HTTP and dry-run delivery targets
//! - [`agent`]: the orchestrator tying it together

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod logger;
pub mod metrics;
pub mod queue;
pub mod signer;
pub mod sink;
pub mod tail;

pub use agent::Agent;
pub use config::{AgentConfig, ConfigError};
pub use error::AgentError;
