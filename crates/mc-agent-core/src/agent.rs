// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Orchestrates tailing, extraction, sampling, signing and delivery.
//!
//! Two tasks run while the agent is up. The orchestrator loop owns the tail
//! reader, the session state and the metrics sampler, and turns log lines and
//! metrics ticks into signed, queued envelopes. The drain task, spawned from
//! here, delivers queued entries. The spool is the only state they share.
//!
//! Shutdown order on cancellation:
//! 1. the batch in progress finishes,
//! 2. a `server_stopped` event is queued unless the server already crashed
//!    (late crash lines are ignored either way),
//! 3. the drain task is stopped and awaited,
//! 4. one last drain pass runs, bounded by `SHUTDOWN_DRAIN_SECS`.
//!
//! Whatever is still queued afterwards is delivered on the next start.

use crate::config::{AgentConfig, ConfigError};
use crate::error::AgentError;
use crate::events::{Event, EventExtractor, EventKind, SessionState, StartOrigin};
use crate::http::get_client;
use crate::metrics::MetricsSampler;
use crate::queue::{Drainer, Spool};
use crate::signer::Signer;
use crate::sink::{DryRunSink, HttpSink, Sink};
use crate::tail::TailReader;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Agent {
    config: AgentConfig,
    signer: Signer,
    spool: Arc<Mutex<Spool>>,
    sink: Arc<dyn Sink>,
    wake: Arc<Notify>,
    tail: TailReader,
    extractor: EventExtractor,
    session: SessionState,
    sampler: MetricsSampler,
}

impl Agent {
    /// Builds every component from configuration. Any error here is fatal
    /// and happens before the run loop starts.
    pub fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let signer = Signer::from_config(&config)?;
        let spool = Spool::open(&config.queue_dir, config.retry, config.dead_letter_max)?;

        let sink: Arc<dyn Sink> = if config.dry_run {
            info!("DRY_RUN enabled, envelopes are printed instead of sent");
            Arc::new(DryRunSink::stdout())
        } else {
            let url = config
                .ingest_url
                .clone()
                .ok_or(ConfigError::MissingIngestUrl)?;
            Arc::new(HttpSink::new(get_client(&config), url, config.http_timeout))
        };

        let sampler = MetricsSampler::new(mc_metrics_collector::default_reader());
        Ok(Self::new(config, signer, spool, sink, sampler))
    }

    pub fn new(
        config: AgentConfig,
        signer: Signer,
        spool: Spool,
        sink: Arc<dyn Sink>,
        sampler: MetricsSampler,
    ) -> Self {
        let tail = TailReader::new(config.log_path.clone(), config.tail_from_start);
        Self {
            config,
            signer,
            spool: Arc::new(Mutex::new(spool)),
            sink,
            wake: Arc::new(Notify::new()),
            tail,
            extractor: EventExtractor::new(),
            session: SessionState::default(),
            sampler,
        }
    }

    pub fn spool(&self) -> Arc<Mutex<Spool>> {
        Arc::clone(&self.spool)
    }

    /// Runs until `cancel` fires, then shuts down in order.
    ///
    /// Returns an error when an event could not be persisted; the shutdown
    /// sequence still runs first.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!(
            "Starting agent for {} tailing {}",
            self.config.server_id,
            self.config.log_path.display()
        );

        let drainer = Drainer::new(
            Arc::clone(&self.spool),
            Arc::clone(&self.sink),
            self.config.drain_interval,
            Arc::clone(&self.wake),
        );
        let drain_cancel = cancel.child_token();
        let drain_task = tokio::spawn(drainer.clone().run(drain_cancel.clone()));

        let mut result = self.emit(EventKind::ServerStarted {
            origin: StartOrigin::AgentBoot,
            startup_secs: None,
        });

        if result.is_ok() {
            result = self.run_loop(&cancel).await;
        }

        if let Some(stopped) = self.extractor.begin_clean_shutdown(&mut self.session) {
            if let Err(e) = self.emit(stopped) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        drain_cancel.cancel();
        if let Err(e) = drain_task.await {
            error!("Drain task ended abnormally: {e}");
            if result.is_ok() {
                result = Err(AgentError::DrainTask(e.to_string()));
            }
        }

        let bound = self.config.shutdown_drain_timeout;
        match tokio::time::timeout(bound, drainer.run_pass(&CancellationToken::new())).await {
            Ok(Ok(report)) => debug!("Final drain pass delivered {} entries", report.delivered),
            Ok(Err(e)) => error!("Final drain pass failed: {e}"),
            Err(_) => warn!("Final drain pass did not finish within {bound:?}"),
        }

        #[allow(clippy::expect_used)]
        let remaining = self.spool.lock().expect("lock poisoned").len();
        if remaining > 0 {
            info!("{remaining} queued entries will be delivered on the next start");
        }
        info!("Agent stopped");
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let mut tail_tick = interval(self.config.tail_poll_interval);
        tail_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let metrics_every = self.config.metrics_interval;
        let mut metrics_tick = interval_at(Instant::now() + metrics_every, metrics_every);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Shutdown requested");
                    return Ok(());
                }
                _ = tail_tick.tick() => self.on_tail_tick()?,
                _ = metrics_tick.tick() => self.on_metrics_tick()?,
            }
        }
    }

    fn on_tail_tick(&mut self) -> Result<(), AgentError> {
        let lines = match self.tail.poll() {
            Ok(lines) => lines,
            Err(e) => {
                warn!("{e}");
                return Ok(());
            }
        };
        for line in lines {
            if let Some(kind) = self.extractor.classify(&mut self.session, &line) {
                self.emit(kind)?;
            }
        }
        Ok(())
    }

    fn on_metrics_tick(&mut self) -> Result<(), AgentError> {
        match self.sampler.sample(&self.session) {
            Some(kind) => self.emit(kind),
            None => Ok(()),
        }
    }

    /// Signs and queues one event, then wakes the drain task.
    ///
    /// Any failure to persist is returned, since the event would otherwise be
    /// lost without trace.
    fn emit(&mut self, kind: EventKind) -> Result<(), AgentError> {
        let name = kind.name();
        let envelope = match self
            .signer
            .sign(Event::new(self.config.server_id.as_str(), kind))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Failed to sign {name} event: {e}");
                return Ok(());
            }
        };

        let queued = {
            #[allow(clippy::expect_used)]
            let mut spool = self.spool.lock().expect("lock poisoned");
            spool.enqueue(envelope)
        };
        match queued {
            Ok(_) => {
                info!("Recorded {name} event");
                self.wake.notify_one();
                Ok(())
            }
            Err(e) => {
                error!("Cannot persist {name} event: {e}");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;
    use crate::signer::Envelope;
    use crate::sink::DeliveryError;
    use async_trait::async_trait;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Envelope>>,
    }

    impl RecordingSink {
        fn names(&self) -> Vec<&'static str> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|envelope| envelope.event.kind.name())
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
            self.received.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn test_config(root: &Path) -> AgentConfig {
        AgentConfig {
            log_path: root.join("latest.log"),
            queue_dir: root.join("queue"),
            tail_poll_interval: Duration::from_millis(10),
            drain_interval: Duration::from_millis(10),
            metrics_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                ..RetryPolicy::DEFAULT
            },
            ..Default::default()
        }
    }

    fn agent(config: AgentConfig, sink: Arc<RecordingSink>) -> Agent {
        let spool = Spool::open(&config.queue_dir, config.retry, config.dead_letter_max).unwrap();
        let sampler = MetricsSampler::with_hostname(
            mc_metrics_collector::default_reader(),
            "test-host".to_string(),
        );
        Agent::new(
            config,
            Signer::new("top-secret").unwrap(),
            spool,
            sink,
            sampler,
        )
    }

    async fn wait_for(sink: &RecordingSink, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while sink.received.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "only got {:?}", sink.names());
    }

    #[tokio::test]
    async fn test_boot_and_clean_shutdown_events() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(test_config(dir.path()), sink.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(cancel.clone()));

        wait_for(&sink, 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sink.names(), vec!["server_started", "server_stopped"]);
        let received = sink.received.lock().unwrap();
        assert_eq!(
            received[0].event.kind,
            EventKind::ServerStarted {
                origin: StartOrigin::AgentBoot,
                startup_secs: None,
            }
        );
        assert!(Signer::new("top-secret").unwrap().verify(&received[0]));
    }

    #[tokio::test]
    async fn test_log_lines_become_events() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let log_path = config.log_path.clone();
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(config, sink.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(cancel.clone()));

        wait_for(&sink, 1).await;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .unwrap();
        log.write_all(
            b"[12:00:01] [Server thread/INFO]: Steve joined the game\n\
              [12:00:09] [Server thread/INFO]: <Steve> hello\n\
              [12:00:30] [Server thread/INFO]: Steve left the game\n",
        )
        .unwrap();
        wait_for(&sink, 3).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        let received = sink.received.lock().unwrap();
        let kinds: Vec<&EventKind> = received.iter().map(|e| &e.event.kind).collect();
        assert_eq!(
            kinds[1..],
            [
                &EventKind::PlayerJoined {
                    player: "Steve".to_string(),
                    players_online: 1,
                },
                &EventKind::PlayerLeft {
                    player: "Steve".to_string(),
                    players_online: 0,
                },
                &EventKind::ServerStopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_crash_then_shutdown_reports_only_crash() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let log_path = config.log_path.clone();
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(config, sink.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(cancel.clone()));

        wait_for(&sink, 1).await;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .unwrap();
        log.write_all(b"[10:00:00] [Server thread/ERROR]: Encountered an unexpected exception\n")
            .unwrap();
        wait_for(&sink, 2).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sink.names(), vec!["server_started", "server_crashed"]);
    }

    #[tokio::test]
    async fn test_enqueue_failure_stops_agent() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let pending = config.queue_dir.join("pending");
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(config, sink.clone());
        std::fs::remove_dir_all(&pending).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run(CancellationToken::new()),
        )
        .await
        .expect("agent kept running after losing its queue");

        assert!(matches!(result, Err(AgentError::Queue(_))));
        assert!(sink.names().is_empty());
    }
}
