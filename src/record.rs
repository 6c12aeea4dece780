use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Severity of a [`LogRecord`].
///
/// Ordinals are part of the wire format and increase with severity, so
/// `Level::Debug < Level::Error` holds for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Debug, Level::Info, Level::Warning, Level::Error];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "Debug",
            Level::Info => "Info",
            Level::Warning => "Warning",
            Level::Error => "Error",
        }
    }

    /// Whether a record of this level passes a `minimum` threshold.
    pub fn passes(self, minimum: Level) -> bool {
        self >= minimum
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Accepts the display names case-insensitively, plus `warn`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// A single log event travelling from a producer to the collector's sinks.
///
/// Records are immutable values: the collector stamps the receipt time with
/// [`LogRecord::processed`], which returns a new record.
///
/// Timestamps that fall on a leap second are stored as the last nanosecond
/// of the preceding second, which is also what the wire format carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    source: String,
    message: String,
    level: Level,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl LogRecord {
    pub fn new(
        source: impl Into<String>,
        message: impl Into<String>,
        level: Level,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            level,
            created_at: fold_leap_second(created_at),
            processed_at: None,
        }
    }

    pub(crate) fn from_parts(
        source: String,
        message: String,
        level: Level,
        created_at: DateTime<Utc>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            source,
            message,
            level,
            created_at: fold_leap_second(created_at),
            processed_at: processed_at.map(fold_leap_second),
        }
    }

    /// Copy of this record carrying the collector's receipt time.
    pub fn processed(&self, at: DateTime<Utc>) -> Self {
        Self {
            processed_at: Some(fold_leap_second(at)),
            ..self.clone()
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    /// Temporal ordering by creation time only.
    pub fn cmp_created(&self, other: &Self) -> Ordering {
        self.created_at.cmp(&other.created_at)
    }
}

fn fold_leap_second(at: DateTime<Utc>) -> DateTime<Utc> {
    if at.nanosecond() < 1_000_000_000 {
        return at;
    }
    at.with_nanosecond(999_999_999).unwrap_or(at)
}
