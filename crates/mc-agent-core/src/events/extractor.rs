// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line classification for Minecraft server logs.
//!
//! # Grammar
//!
//! A line is an optional header followed by a message. The header ends at the
//! first `]: ` of a line that starts with `[`:
//!
//! ```text
//! [12:34:56] [Server thread/INFO]: Steve joined the game
//! [12:34:56] [Server thread/INFO] [minecraft/DedicatedServer]: Steve left the game
//! ```
//!
//! Messages are matched against a closed set of rules, first match wins:
//!
//! | Rule             | Message                                            | Event            |
//! |------------------|----------------------------------------------------|------------------|
//! | `ServerStarted`  | `Done (4.25s)! For help, type "help"`              | `server_started` |
//! | `PlayerJoined`   | `<name> joined the game`, `joined the game: <name>`| `player_joined`  |
//! | `PlayerLeft`     | `<name> left the game`, `left the game: <name>`    | `player_left`    |
//! | `ServerStopping` | `Stopping server`                                  | none             |
//! | `ServerCrashed`  | crash report / tick loop exception signatures      | `server_crashed` |
//!
//! Anything else is not an event and leaves the session untouched.

use crate::events::{EventKind, StartOrigin};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

lazy_static! {
    static ref SERVER_STARTED_REGEX: Regex =
        Regex::new(r#"^Done \((?P<secs>\d+(?:\.\d+)?)s\)! For help, type "help""#)
            .expect("failed creating regex");
    static ref PLAYER_JOINED_REGEX: Regex =
        Regex::new(r"^(?P<player>[^\s<>\[\]]+) joined the game$").expect("failed creating regex");
    static ref PLAYER_JOINED_ALT_REGEX: Regex =
        Regex::new(r"^joined the game:\s*(?P<player>[^\s<>\[\]]+)$")
            .expect("failed creating regex");
    static ref PLAYER_LEFT_REGEX: Regex =
        Regex::new(r"^(?P<player>[^\s<>\[\]]+) left the game$").expect("failed creating regex");
    static ref PLAYER_LEFT_ALT_REGEX: Regex =
        Regex::new(r"^left the game:\s*(?P<player>[^\s<>\[\]]+)$").expect("failed creating regex");
    static ref SERVER_STOPPING_REGEX: Regex =
        Regex::new(r"^Stopping (?:the )?server$").expect("failed creating regex");
}

/// Abnormal-termination signatures written by the server.
const CRASH_SIGNATURES: [&str; 4] = [
    "---- Minecraft Crash Report ----",
    "This crash report has been saved to:",
    "Encountered an unexpected exception",
    "Exception in server tick loop",
];

/// Lifecycle of the observed server process as seen through its log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerPhase {
    #[default]
    Running,
    /// A clean shutdown is in progress; crash signatures are ignored
    Stopping,
    /// A crash was reported; further signatures belong to the same crash
    Crashed,
}

/// Players currently online, as derived from join and leave lines.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    players: BTreeSet<String>,
    phase: ServerPhase,
}

impl SessionState {
    pub fn players_online(&self) -> usize {
        self.players.len()
    }

    pub fn has_players(&self) -> bool {
        !self.players.is_empty()
    }

    pub fn is_online(&self, player: &str) -> bool {
        self.players.contains(player)
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }
}

/// The rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    ServerStarted,
    PlayerJoined,
    PlayerLeft,
    ServerStopping,
    ServerCrashed,
}

const RULES: [Rule; 5] = [
    Rule::ServerStarted,
    Rule::PlayerJoined,
    Rule::PlayerLeft,
    Rule::ServerStopping,
    Rule::ServerCrashed,
];

/// What a rule recognized in a message, before it is applied to the session.
#[derive(Debug, Clone, PartialEq)]
enum Matched {
    ServerStarted { startup_secs: Option<f64> },
    PlayerJoined(String),
    PlayerLeft(String),
    ServerStopping,
    ServerCrashed(String),
}

impl Rule {
    fn matches(self, message: &str) -> Option<Matched> {
        match self {
            Rule::ServerStarted => SERVER_STARTED_REGEX.captures(message).map(|caps| {
                Matched::ServerStarted {
                    startup_secs: caps.name("secs").and_then(|m| m.as_str().parse().ok()),
                }
            }),
            Rule::PlayerJoined => capture_player(message, &PLAYER_JOINED_REGEX)
                .or_else(|| capture_player(message, &PLAYER_JOINED_ALT_REGEX))
                .map(Matched::PlayerJoined),
            Rule::PlayerLeft => capture_player(message, &PLAYER_LEFT_REGEX)
                .or_else(|| capture_player(message, &PLAYER_LEFT_ALT_REGEX))
                .map(Matched::PlayerLeft),
            Rule::ServerStopping => SERVER_STOPPING_REGEX
                .is_match(message)
                .then_some(Matched::ServerStopping),
            Rule::ServerCrashed => CRASH_SIGNATURES
                .iter()
                .any(|signature| message.contains(signature))
                .then(|| Matched::ServerCrashed(message.to_string())),
        }
    }
}

fn capture_player(message: &str, regex: &Regex) -> Option<String> {
    regex
        .captures(message)
        .and_then(|caps| caps.name("player"))
        .map(|m| m.as_str().to_string())
}

/// Strips the `[time] [thread/LEVEL]: ` header, if any.
fn message_of(line: &str) -> &str {
    let line = line.trim();
    if line.starts_with('[') {
        if let Some(idx) = line.find("]: ") {
            return line[idx + 3..].trim();
        }
    }
    line
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventExtractor;

impl EventExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Classifies one log line into zero or one event, updating the session.
    pub fn classify(&self, session: &mut SessionState, line: &str) -> Option<EventKind> {
        let message = message_of(line);
        if message.is_empty() {
            return None;
        }
        let matched = RULES.iter().find_map(|rule| rule.matches(message))?;
        apply(session, matched)
    }

    /// Records that the agent is shutting down cleanly, so that crash
    /// signatures logged during the same termination are not reported.
    ///
    /// Returns the `server_stopped` event to report, or `None` when the
    /// server already crashed: one termination is either a crash or a stop.
    pub fn begin_clean_shutdown(&self, session: &mut SessionState) -> Option<EventKind> {
        if session.phase == ServerPhase::Crashed {
            debug!("Server already crashed, not reporting a clean stop");
            return None;
        }
        session.phase = ServerPhase::Stopping;
        Some(EventKind::ServerStopped)
    }
}

fn apply(session: &mut SessionState, matched: Matched) -> Option<EventKind> {
    match matched {
        Matched::ServerStarted { startup_secs } => {
            if !session.players.is_empty() {
                debug!(
                    "Server restarted, clearing {} stale players",
                    session.players.len()
                );
            }
            session.players.clear();
            session.phase = ServerPhase::Running;
            info!("Server finished starting");
            Some(EventKind::ServerStarted {
                origin: StartOrigin::ServerLog,
                startup_secs,
            })
        }
        Matched::PlayerJoined(player) => {
            if !session.players.insert(player.clone()) {
                debug!("Player {player} joined while already online");
            }
            Some(EventKind::PlayerJoined {
                player,
                players_online: session.players.len(),
            })
        }
        Matched::PlayerLeft(player) => {
            if !session.players.remove(&player) {
                // Expected after an agent restart, the join happened before we started tailing
                warn!("Ignoring leave of player {player} who was not seen joining");
                return None;
            }
            Some(EventKind::PlayerLeft {
                player,
                players_online: session.players.len(),
            })
        }
        Matched::ServerStopping => {
            if session.phase == ServerPhase::Crashed {
                debug!("Ignoring stop after crash");
                return None;
            }
            info!("Server is stopping");
            session.phase = ServerPhase::Stopping;
            None
        }
        Matched::ServerCrashed(signature) => {
            if session.phase != ServerPhase::Running {
                debug!("Ignoring crash signature in phase {:?}", session.phase);
                return None;
            }
            warn!("Server crash detected: {signature}");
            session.phase = ServerPhase::Crashed;
            session.players.clear();
            Some(EventKind::ServerCrashed { signature })
        }
    }
}
