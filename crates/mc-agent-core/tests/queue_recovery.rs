// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use mc_agent_core::events::{Event, EventKind};
use mc_agent_core::queue::{Drainer, RetryPolicy, Spool};
use mc_agent_core::signer::{Envelope, Signer};
use mc_agent_core::sink::{DeliveryError, Sink};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        self.received.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

fn joined(signer: &Signer, player: &str, online: usize) -> Envelope {
    signer
        .sign(Event::new(
            "minecraft-01",
            EventKind::PlayerJoined {
                player: player.to_string(),
                players_online: online,
            },
        ))
        .unwrap()
}

#[tokio::test]
async fn queued_entries_survive_restart_in_order_exactly_once() {
    let dir = tempdir().unwrap();
    let signer = Signer::new("top-secret").unwrap();

    // First run: queue three events and "crash" before delivering any
    let expected: Vec<Envelope> = {
        let mut spool = Spool::open(dir.path(), RetryPolicy::DEFAULT, 100).unwrap();
        ["Steve", "Alex", "Notch"]
            .iter()
            .enumerate()
            .map(|(i, player)| {
                spool
                    .enqueue(joined(&signer, player, i + 1))
                    .unwrap()
                    .envelope
            })
            .collect()
    };

    // A write torn by the crash
    fs::write(
        dir.path().join("pending").join("00000000000000000004.json.tmp"),
        b"{\"seq\":4,\"enve",
    )
    .unwrap();

    // Second run
    let spool = Arc::new(Mutex::new(
        Spool::open(dir.path(), RetryPolicy::DEFAULT, 100).unwrap(),
    ));
    let sink = Arc::new(RecordingSink::default());
    let drainer = Drainer::new(
        spool.clone(),
        sink.clone(),
        Duration::from_secs(1),
        Arc::new(Notify::new()),
    );

    let report = drainer.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.delivered, 3);
    let report = drainer.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.attempted(), 0);

    let received = sink.received.lock().unwrap();
    assert_eq!(*received, expected);
    assert!(received.iter().all(|envelope| signer.verify(envelope)));
    assert!(spool.lock().unwrap().is_empty());
    assert_eq!(
        fs::read_dir(dir.path().join("pending")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn retry_state_survives_restart() {
    let dir = tempdir().unwrap();
    let signer = Signer::new("top-secret").unwrap();

    let seq = {
        let mut spool = Spool::open(dir.path(), RetryPolicy::DEFAULT, 100).unwrap();
        let seq = spool.enqueue(joined(&signer, "Steve", 1)).unwrap().seq;
        spool.record_failure(seq, 0).unwrap();
        spool.record_failure(seq, 0).unwrap();
        seq
    };

    let mut spool = Spool::open(dir.path(), RetryPolicy::DEFAULT, 100).unwrap();
    let entry = spool.peek(seq).unwrap().unwrap();
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.next_attempt_at_ms, 4_000);
}
