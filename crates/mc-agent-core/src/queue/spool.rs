// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-safe on-disk delivery queue.
//!
//! Layout under the queue directory:
//!
//! ```text
//! pending/<seq:020>.json   one entry per file, oldest sequence first
//! dead/<seq:020>.json      entries that ran out of attempts or age
//! quarantine/<name>        files that could not be parsed
//! ```
//!
//! Every mutation goes through [`fsync::write_atomic`] or a durable rename,
//! so after a crash each entry is either fully present or absent. Staging
//! files (`*.tmp`) left behind by a crash are deleted at open and never
//! replayed.
//!
//! Entries found on disk at open are indexed by file name and parsed lazily
//! the first time a drain reaches them; a file that fails to parse is moved
//! to `quarantine/` and the drain moves on.

use super::backoff::RetryPolicy;
use super::fsync::{self, TMP_EXTENSION};
use crate::clock;
use crate::signer::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const PENDING_DIR: &str = "pending";
const DEAD_DIR: &str = "dead";
const QUARANTINE_DIR: &str = "quarantine";
const ENTRY_EXTENSION: &str = "json";
const PROBE_FILE: &str = ".write-probe.tmp";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage is full or read-only: {0}")]
    StorageFull(#[source] io::Error),

    #[error("queue directory {} is not writable: {source}", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("queue I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("failed to encode queue entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no pending queue entry with sequence {0}")]
    UnknownEntry(u64),
}

impl From<io::Error> for QueueError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::StorageFull
            | io::ErrorKind::QuotaExceeded
            | io::ErrorKind::ReadOnlyFilesystem => QueueError::StorageFull(e),
            _ => QueueError::Io(e),
        }
    }
}

/// One persisted delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub seq: u64,
    pub envelope: Envelope,
    pub enqueued_at_ms: u64,
    /// Failed delivery attempts so far
    pub attempt_count: u32,
    /// Earliest time the next attempt may start
    pub next_attempt_at_ms: u64,
}

impl QueueEntry {
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.enqueued_at_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still pending, with the backoff applied
    Retry {
        attempt_count: u32,
        next_attempt_at_ms: u64,
    },
    /// Moved to `dead/` and out of rotation
    DeadLettered { attempt_count: u32 },
}

#[derive(Debug)]
enum Slot {
    /// Indexed from a file name, not parsed yet
    Unread,
    Loaded(QueueEntry),
}

#[derive(Debug)]
pub struct Spool {
    pending_dir: PathBuf,
    dead_dir: PathBuf,
    quarantine_dir: PathBuf,
    policy: RetryPolicy,
    dead_letter_max: usize,
    next_seq: u64,
    entries: BTreeMap<u64, Slot>,
}

impl Spool {
    /// Opens (creating if needed) the queue rooted at `root` and recovers
    /// whatever a previous run left behind.
    ///
    /// Fails with [`QueueError::NotWritable`] when the directory cannot be
    /// created or written to.
    pub fn open(
        root: &Path,
        policy: RetryPolicy,
        dead_letter_max: usize,
    ) -> Result<Self, QueueError> {
        let pending_dir = root.join(PENDING_DIR);
        let dead_dir = root.join(DEAD_DIR);
        let quarantine_dir = root.join(QUARANTINE_DIR);

        for dir in [&pending_dir, &dead_dir, &quarantine_dir] {
            fs::create_dir_all(dir).map_err(|source| QueueError::NotWritable {
                path: dir.clone(),
                source,
            })?;
        }
        remove_leftover_tmp(&pending_dir)?;
        remove_leftover_tmp(&dead_dir)?;
        probe_writable(&pending_dir)?;

        let mut spool = Self {
            pending_dir,
            dead_dir,
            quarantine_dir,
            policy,
            dead_letter_max,
            next_seq: 1,
            entries: BTreeMap::new(),
        };

        let mut max_seq = 0;
        for name in file_names(&spool.pending_dir)? {
            match parse_seq(&name) {
                Some(seq) => {
                    spool.entries.insert(seq, Slot::Unread);
                    max_seq = max_seq.max(seq);
                }
                None => spool.quarantine(&name, "unrecognized file name")?,
            }
        }
        for dir in [&spool.dead_dir, &spool.quarantine_dir] {
            for name in file_names(dir)? {
                if let Some(seq) = parse_seq(&name) {
                    max_seq = max_seq.max(seq);
                }
            }
        }
        spool.next_seq = max_seq.saturating_add(1);
        spool.prune_dead()?;

        if !spool.entries.is_empty() {
            info!(
                "Recovered {} pending queue entries from {}",
                spool.entries.len(),
                root.display()
            );
        }
        Ok(spool)
    }

    /// Durably appends an envelope to the queue.
    pub fn enqueue(&mut self, envelope: Envelope) -> Result<QueueEntry, QueueError> {
        self.enqueue_at(envelope, clock::unix_millis())
    }

    pub fn enqueue_at(
        &mut self,
        envelope: Envelope,
        now_ms: u64,
    ) -> Result<QueueEntry, QueueError> {
        let seq = self.next_seq;
        let entry = QueueEntry {
            seq,
            envelope,
            enqueued_at_ms: now_ms,
            attempt_count: 0,
            next_attempt_at_ms: now_ms,
        };
        fsync::write_atomic(&self.entry_path(seq), &serde_json::to_vec(&entry)?)?;
        self.next_seq += 1;
        self.entries.insert(seq, Slot::Loaded(entry.clone()));
        debug!(
            "Queued {} event as entry {seq}",
            entry.envelope.event.kind.name()
        );
        Ok(entry)
    }

    /// Oldest entry that may be attempted now.
    ///
    /// Entries in `skip` were already attempted in the current pass. An entry
    /// inside its fast-retry window blocks every later entry; one past it is
    /// skipped over while it waits out its backoff.
    pub fn next_ready(
        &mut self,
        now_ms: u64,
        skip: &HashSet<u64>,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let policy = self.policy;
        let seqs: Vec<u64> = self.entries.keys().copied().collect();
        for seq in seqs {
            let Some(entry) = self.load(seq)? else {
                continue;
            };
            if !skip.contains(&seq) && entry.next_attempt_at_ms <= now_ms {
                return Ok(Some(entry.clone()));
            }
            if policy.blocks_head_of_line(entry.attempt_count) {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Removes a delivered entry.
    pub fn ack(&mut self, seq: u64) -> Result<(), QueueError> {
        if !self.entries.contains_key(&seq) {
            return Err(QueueError::UnknownEntry(seq));
        }
        fsync::remove_durable(&self.entry_path(seq))?;
        self.entries.remove(&seq);
        Ok(())
    }

    /// Records a failed attempt: either reschedules the entry with backoff or
    /// dead-letters it once it is out of attempts or too old.
    pub fn record_failure(&mut self, seq: u64, now_ms: u64) -> Result<FailureOutcome, QueueError> {
        let policy = self.policy;
        let mut entry = match self.load(seq)? {
            Some(entry) => entry.clone(),
            None => return Err(QueueError::UnknownEntry(seq)),
        };
        entry.attempt_count = entry.attempt_count.saturating_add(1);

        if policy.is_exhausted(entry.attempt_count, entry.age(now_ms)) {
            let attempt_count = entry.attempt_count;
            self.dead_letter(entry)?;
            return Ok(FailureOutcome::DeadLettered { attempt_count });
        }

        let delay = policy.delay_for_attempt(entry.attempt_count);
        entry.next_attempt_at_ms =
            now_ms.saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        fsync::write_atomic(&self.entry_path(seq), &serde_json::to_vec(&entry)?)?;

        let outcome = FailureOutcome::Retry {
            attempt_count: entry.attempt_count,
            next_attempt_at_ms: entry.next_attempt_at_ms,
        };
        self.entries.insert(seq, Slot::Loaded(entry));
        Ok(outcome)
    }

    /// Current state of a pending entry.
    pub fn peek(&mut self, seq: u64) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.load(seq)?.cloned())
    }

    /// Sequence numbers of pending entries, oldest first.
    pub fn pending_seqs(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    pub fn dead_dir(&self) -> &Path {
        &self.dead_dir
    }

    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine_dir
    }

    fn entry_path(&self, seq: u64) -> PathBuf {
        self.pending_dir.join(entry_name(seq))
    }

    fn load(&mut self, seq: u64) -> Result<Option<&QueueEntry>, QueueError> {
        if matches!(self.entries.get(&seq), Some(Slot::Unread)) {
            self.read_entry(seq)?;
        }
        Ok(match self.entries.get(&seq) {
            Some(Slot::Loaded(entry)) => Some(entry),
            _ => None,
        })
    }

    /// Parses an indexed file, replacing its slot, or drops it from the
    /// index if it is gone or malformed.
    fn read_entry(&mut self, seq: u64) -> Result<(), QueueError> {
        let name = entry_name(seq);
        let bytes = match fs::read(self.pending_dir.join(&name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Queue file {name} disappeared, dropping it from the index");
                self.entries.remove(&seq);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<QueueEntry>(&bytes) {
            Ok(entry) if entry.seq == seq => {
                self.entries.insert(seq, Slot::Loaded(entry));
            }
            Ok(entry) => {
                self.entries.remove(&seq);
                let reason = format!("contains sequence {} instead of {seq}", entry.seq);
                self.quarantine(&name, &reason)?;
            }
            Err(e) => {
                self.entries.remove(&seq);
                self.quarantine(&name, &e.to_string())?;
            }
        }
        Ok(())
    }

    fn quarantine(&self, name: &str, reason: &str) -> Result<(), QueueError> {
        let mut target = self.quarantine_dir.join(name);
        let mut suffix = 1;
        while target.exists() {
            target = self.quarantine_dir.join(format!("{name}.{suffix}"));
            suffix += 1;
        }
        fsync::move_durable(&self.pending_dir.join(name), &target)?;
        warn!(
            "Quarantined malformed queue file {name} to {}: {reason}",
            target.display()
        );
        Ok(())
    }

    fn dead_letter(&mut self, entry: QueueEntry) -> Result<(), QueueError> {
        let name = entry_name(entry.seq);
        fsync::write_atomic(&self.dead_dir.join(&name), &serde_json::to_vec(&entry)?)?;
        fsync::remove_durable(&self.pending_dir.join(&name))?;
        self.entries.remove(&entry.seq);
        warn!(
            "Dead-lettered {} event (entry {}) after {} failed attempts",
            entry.envelope.event.kind.name(),
            entry.seq,
            entry.attempt_count
        );
        self.prune_dead()
    }

    /// Keeps at most `dead_letter_max` files in `dead/`, oldest removed first.
    fn prune_dead(&self) -> Result<(), QueueError> {
        let mut dead: Vec<(u64, String)> = file_names(&self.dead_dir)?
            .into_iter()
            .filter_map(|name| parse_seq(&name).map(|seq| (seq, name)))
            .collect();
        if dead.len() <= self.dead_letter_max {
            return Ok(());
        }
        dead.sort_unstable();
        let excess = dead.len() - self.dead_letter_max;
        for (_, name) in dead.iter().take(excess) {
            fsync::remove_durable(&self.dead_dir.join(name))?;
        }
        warn!(
            "Dead-letter retention of {} exceeded, removed {excess} oldest entries",
            self.dead_letter_max
        );
        Ok(())
    }
}

fn entry_name(seq: u64) -> String {
    format!("{seq:020}.{ENTRY_EXTENSION}")
}

fn parse_seq(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(ENTRY_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Names of the regular files in `dir`. Names that are not valid UTF-8 are
/// skipped.
fn file_names(dir: &Path) -> Result<Vec<String>, QueueError> {
    let mut names = Vec::new();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        match dir_entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => warn!("Ignoring queue file with non UTF-8 name {name:?}"),
        }
    }
    Ok(names)
}

fn remove_leftover_tmp(dir: &Path) -> Result<(), QueueError> {
    let suffix = format!(".{TMP_EXTENSION}");
    let mut removed = 0;
    for name in file_names(dir)? {
        if name.ends_with(&suffix) {
            fs::remove_file(dir.join(&name))?;
            removed += 1;
        }
    }
    if removed > 0 {
        fsync::fsync_dir(dir)?;
        info!(
            "Removed {removed} incomplete queue writes from {}",
            dir.display()
        );
    }
    Ok(())
}

fn probe_writable(dir: &Path) -> Result<(), QueueError> {
    let probe = dir.join(PROBE_FILE);
    File::create(&probe)
        .and_then(|file| file.sync_all())
        .and_then(|()| fs::remove_file(&probe))
        .map_err(|source| QueueError::NotWritable {
            path: dir.to_path_buf(),
            source,
        })
}
