// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::spool::{FailureOutcome, QueueError, Spool};
use crate::clock;
use crate::sink::Sink;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Counts from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.dead_lettered
    }
}

/// Consumer side of the queue.
///
/// The spool lock is held only around local file operations, never while a
/// delivery is in flight, so producers can keep enqueueing during slow or
/// hanging requests.
#[derive(Clone)]
pub struct Drainer {
    spool: Arc<Mutex<Spool>>,
    sink: Arc<dyn Sink>,
    interval: Duration,
    wake: Arc<Notify>,
}

impl Drainer {
    pub fn new(
        spool: Arc<Mutex<Spool>>,
        sink: Arc<dyn Sink>,
        interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            spool,
            sink,
            interval,
            wake,
        }
    }

    /// Attempts every entry that is ready, each at most once, in queue order.
    ///
    /// Stops early once `cancel` fires; the entry in flight at that moment
    /// still gets its outcome recorded.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<DrainReport, QueueError> {
        let mut report = DrainReport::default();
        let mut attempted = HashSet::new();

        while !cancel.is_cancelled() {
            let next = {
                #[allow(clippy::expect_used)]
                let mut spool = self.spool.lock().expect("lock poisoned");
                spool.next_ready(clock::unix_millis(), &attempted)?
            };
            let Some(entry) = next else {
                break;
            };
            attempted.insert(entry.seq);

            let result = self.sink.deliver(&entry.envelope).await;

            #[allow(clippy::expect_used)]
            let mut spool = self.spool.lock().expect("lock poisoned");
            match result {
                Ok(()) => {
                    spool.ack(entry.seq)?;
                    report.delivered += 1;
                    debug!(
                        "Delivered {} event (entry {})",
                        entry.envelope.event.kind.name(),
                        entry.seq
                    );
                }
                Err(e) => match spool.record_failure(entry.seq, clock::unix_millis())? {
                    FailureOutcome::Retry {
                        attempt_count,
                        next_attempt_at_ms,
                    } => {
                        report.retried += 1;
                        warn!(
                            "Failed to deliver entry {} (attempt {attempt_count}): {e}, retrying in {}ms",
                            entry.seq,
                            next_attempt_at_ms.saturating_sub(clock::unix_millis())
                        );
                    }
                    FailureOutcome::DeadLettered { .. } => {
                        report.dead_lettered += 1;
                        warn!("Failed to deliver entry {}: {e}", entry.seq);
                    }
                },
            }
        }

        if report.attempted() > 0 {
            debug!(
                "Drain pass finished: {} delivered, {} retried, {} dead-lettered",
                report.delivered, report.retried, report.dead_lettered
            );
        }
        Ok(report)
    }

    /// Drains on every interval tick and whenever woken, until cancelled.
    ///
    /// Queue errors end the pass but not the loop; the entries stay on disk
    /// for the next pass.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Drain task stopping");
                    break;
                }
                _ = interval.tick() => {}
                () = self.wake.notified() => {}
            }

            if let Err(e) = self.run_pass(&cancel).await {
                error!("Drain pass failed: {e}");
            }
        }
    }
}
