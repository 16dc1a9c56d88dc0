// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log record type and PgBouncer line parsing.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Discriminator message every record is emitted under.
pub const RECORD_MESSAGE: &str = "record";

/// `2024-01-01 00:00:00.000 UTC [123] LOG message text`
static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{1,2}:\d{2}:\d{2}\.\d{3} \w+) \[(\d+)\] ([A-Z]+) (.+)$")
        .expect("log line pattern is a valid literal")
});

/// Output stream a record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipe {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
}

impl Pipe {
    /// Name used in log fields and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipe::Stdout => "stdout",
            Pipe::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of child output.
///
/// When `matched` is true all four structured fields are non-empty. When it
/// is false only `message` is set and it holds the raw line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp including the zone name, as written by PgBouncer.
    pub timestamp: String,
    /// PgBouncer process id.
    pub pid: String,
    /// Upper-case level such as `LOG`, `WARNING` or `ERROR`.
    pub level: String,
    /// Message text, or the whole line when unmatched.
    pub message: String,
    /// Whether the line followed PgBouncer's log format.
    pub matched: bool,
}

impl LogRecord {
    /// Parse a single line (without its terminator).
    pub fn parse(line: &str) -> Self {
        match LINE_PATTERN.captures(line) {
            Some(caps) => Self {
                timestamp: caps[1].to_string(),
                pid: caps[2].to_string(),
                level: caps[3].to_string(),
                message: caps[4].to_string(),
                matched: true,
            },
            None => Self::unmatched(line),
        }
    }

    /// Record carrying a raw line that does not follow the log format.
    pub fn unmatched(line: &str) -> Self {
        Self {
            message: line.to_string(),
            ..Self::default()
        }
    }
}
