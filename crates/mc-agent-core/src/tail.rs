// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polling tail reader for a rotatable, append-only log file.
//!
//! Each [`TailReader::poll`] opens the file, reads what was appended since the
//! last call and releases the handle again, so rotation never leaves the agent
//! holding a deleted file. Rotation is detected when the file's identity
//! (device and inode) changes or it shrinks below the saved offset; either
//! way reading restarts at offset 0.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Upper bound on bytes read by a single poll.
pub const TAIL_MAX_BATCH_BYTES: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("failed to stat {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Identifies one file instance behind a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    /// Without inode numbers only shrinking reveals a rotation.
    #[cfg(not(unix))]
    pub fn of(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TailState {
    /// Set once any poll has run, whether or not the file existed
    polled: bool,
    /// Set once a file instance has been seen at the path
    attached: bool,
    identity: Option<FileIdentity>,
    /// Byte offset of the next unread byte
    offset: u64,
    /// Bytes after the last newline, waiting for the rest of their line
    partial: Vec<u8>,
}

impl TailState {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn pending_partial(&self) -> usize {
        self.partial.len()
    }

    fn reset(&mut self, identity: Option<FileIdentity>, offset: u64) {
        self.identity = identity;
        self.offset = offset;
        self.partial.clear();
    }
}

#[derive(Debug)]
pub struct TailReader {
    path: PathBuf,
    from_start: bool,
    max_batch_bytes: u64,
    state: TailState,
}

impl TailReader {
    /// A file already present on the first poll is read from its end unless
    /// `from_start` is set. Files appearing later, and rotated files, are
    /// always read from the beginning.
    pub fn new(path: impl Into<PathBuf>, from_start: bool) -> Self {
        Self {
            path: path.into(),
            from_start,
            max_batch_bytes: TAIL_MAX_BATCH_BYTES,
            state: TailState::default(),
        }
    }

    #[must_use]
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: u64) -> Self {
        self.max_batch_bytes = max_batch_bytes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &TailState {
        &self.state
    }

    /// Returns the complete lines appended since the previous call.
    ///
    /// A missing file yields an empty batch.
    pub fn poll(&mut self) -> Result<Vec<String>, TailError> {
        let first_poll = !std::mem::replace(&mut self.state.polled, true);

        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if first_poll {
                    debug!("{} does not exist yet, waiting for it", self.path.display());
                }
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(TailError::Stat {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let identity = FileIdentity::of(&metadata);
        let size = metadata.len();

        if !self.state.attached {
            self.state.attached = true;
            let offset = if first_poll && !self.from_start {
                size
            } else {
                0
            };
            self.state.reset(identity, offset);
            info!("Tailing {} from offset {offset}", self.path.display());
        } else if identity != self.state.identity || size < self.state.offset {
            info!(
                "Detected rotation of {}, reading from the start",
                self.path.display()
            );
            self.state.reset(identity, 0);
        }

        if size == self.state.offset {
            return Ok(Vec::new());
        }

        let chunk = match self.read_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(TailError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        self.state.offset += chunk.len() as u64;
        Ok(self.split_lines(chunk))
    }

    /// Reads from the saved offset, capped at the batch size. `None` when the
    /// opened file is not the one that was stat'ed; the next poll sorts it out.
    fn read_chunk(&self) -> io::Result<Option<Vec<u8>>> {
        let mut file = File::open(&self.path)?;
        if FileIdentity::of(&file.metadata()?) != self.state.identity {
            debug!(
                "{} was replaced while opening it, retrying on the next poll",
                self.path.display()
            );
            return Ok(None);
        }
        file.seek(SeekFrom::Start(self.state.offset))?;
        let mut chunk = Vec::new();
        file.take(self.max_batch_bytes).read_to_end(&mut chunk)?;
        Ok(Some(chunk))
    }

    fn split_lines(&mut self, chunk: Vec<u8>) -> Vec<String> {
        let mut data = std::mem::take(&mut self.state.partial);
        data.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (idx, byte) in data.iter().enumerate() {
            if *byte == b'\n' {
                lines.push(decode_line(&data[start..idx]));
                start = idx + 1;
            }
        }

        let rest = &data[start..];
        if rest.len() as u64 > self.max_batch_bytes {
            warn!(
                "Line in {} exceeds {} bytes without a newline, emitting it as is",
                self.path.display(),
                self.max_batch_bytes
            );
            lines.push(decode_line(rest));
        } else {
            self.state.partial = rest.to_vec();
        }
        lines
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
