// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable at-least-once delivery of signed envelopes.
//!
//! Per entry: PENDING, then either DELIVERED (file removed after a 2xx), back
//! to PENDING with one more failed attempt and a later retry time, or
//! DEAD_LETTERED (moved to `dead/`) once attempts or age run out.

pub mod backoff;
pub mod drain;
pub mod fsync;
pub mod spool;

pub use backoff::RetryPolicy;
pub use drain::{DrainReport, Drainer};
pub use spool::{FailureOutcome, QueueEntry, QueueError, Spool};
