//! Producer-side durable queue for records that could not be delivered.
//!
//! The backing file is an append log with one entry per line:
//!
//! ```text
//! 2024-05-01T12:00:00.123456789Z | Info;billing-7;payment failed
//! ```
//!
//! Backslash, CR and LF are escaped in every field; `;` is additionally
//! escaped in level and source, so the payload always splits on its first
//! two separators and the message may contain `;` freely.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::record::{Level, LogRecord};

const TIMESTAMP_SEPARATOR: &str = " | ";

/// Target that replayed records are written to, usually the live connection.
#[async_trait]
pub trait ReplaySink: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn replay_record(&mut self, record: LogRecord) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum ReplayError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("replay target failed: {0}")]
    Sink(#[source] E),
}

/// Append-only fallback store with replay bookkeeping.
///
/// `stored` counts entries in the backing file, `replayed` counts entries
/// already handed to a [`ReplaySink`] during this process's lifetime.
#[derive(Debug)]
pub struct FallbackCache {
    path: PathBuf,
    stored: usize,
    replayed: usize,
}

impl FallbackCache {
    /// Open the cache at `path`, counting entries left by a previous run.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let stored = count_entries(&path).await?;
        if stored > 0 {
            info!(path = %path.display(), entries = stored, "fallback cache holds undelivered records");
        }
        Ok(Self {
            path,
            stored,
            replayed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stored(&self) -> usize {
        self.stored
    }

    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Entries not yet replayed.
    pub fn pending(&self) -> usize {
        self.stored - self.replayed
    }

    /// Persist one record, stamped with the current wall-clock time.
    ///
    /// The entry is synced to disk before returning.
    pub async fn append(&mut self, record: &LogRecord) -> Result<(), CacheError> {
        let line = encode_entry(Utc::now(), record);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.sync_data().await.map_err(|e| self.io_error(e))?;

        self.stored += 1;
        debug!(path = %self.path.display(), stored = self.stored, "cached undelivered record");
        Ok(())
    }

    /// Hand every not-yet-replayed entry to `sink` in append order.
    ///
    /// Progress is kept across calls: if `sink` fails, the failing entry is
    /// retried first on the next call. Corrupt entries are skipped and count
    /// as replayed. Once everything is replayed the backing file is removed.
    pub async fn replay<S>(&mut self, sink: &mut S) -> Result<usize, ReplayError<S::Error>>
    where
        S: ReplaySink + ?Sized,
    {
        if self.pending() == 0 {
            self.is_drained().await?;
            return Ok(0);
        }

        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) => return Err(self.io_error(e).into()),
        };

        let mut sent = 0;
        for (index, line) in entry_lines(&contents)
            .enumerate()
            .skip(self.replayed)
            .take(self.pending())
        {
            let decoded = std::str::from_utf8(line)
                .map_err(|e| format!("invalid UTF-8: {e}"))
                .and_then(decode_entry);
            match decoded {
                Ok(record) => {
                    sink.replay_record(record).await.map_err(ReplayError::Sink)?;
                    sent += 1;
                }
                Err(reason) => {
                    let err = CacheError::Corrupt { index, reason };
                    warn!(path = %self.path.display(), error = %err, "skipping corrupt fallback cache entry");
                }
            }
            self.replayed += 1;
        }

        // Fewer lines than counted means the file was cut short externally.
        if self.replayed < self.stored {
            warn!(
                path = %self.path.display(),
                missing = self.stored - self.replayed,
                "fallback cache shorter than expected"
            );
            self.replayed = self.stored;
        }

        self.is_drained().await?;
        info!(path = %self.path.display(), replayed = sent, "replayed cached records");
        Ok(sent)
    }

    /// True once every stored entry was replayed.
    ///
    /// The first call that observes the drained state deletes the backing
    /// file and resets both counters; later calls are no-ops.
    pub async fn is_drained(&mut self) -> Result<bool, CacheError> {
        if self.replayed < self.stored {
            return Ok(false);
        }
        if self.stored > 0 {
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error(e)),
            }
            self.stored = 0;
            self.replayed = 0;
            debug!(path = %self.path.display(), "fallback cache removed");
        }
        Ok(true)
    }

    fn io_error(&self, source: io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

async fn count_entries(path: &Path) -> Result<usize, CacheError> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };

    // Counted by bytes: a torn multi-byte character must not stop the
    // entries after it from being found.
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return Ok(count),
            Ok(_) => count += 1,
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }
}

/// Entries of a cache file, split the way [`count_entries`] counts them.
fn entry_lines(contents: &[u8]) -> impl Iterator<Item = &[u8]> {
    contents
        .split_inclusive(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\n").unwrap_or(line))
}

fn encode_entry(at: DateTime<Utc>, record: &LogRecord) -> String {
    let mut line = at.to_rfc3339_opts(SecondsFormat::Nanos, true);
    line.push_str(TIMESTAMP_SEPARATOR);
    escape_into(record.level().as_str(), true, &mut line);
    line.push(';');
    escape_into(record.source(), true, &mut line);
    line.push(';');
    escape_into(record.message(), false, &mut line);
    line.push('\n');
    line
}

fn decode_entry(line: &str) -> Result<LogRecord, String> {
    let (timestamp, payload) = line
        .split_once(TIMESTAMP_SEPARATOR)
        .ok_or_else(|| "missing timestamp separator".to_string())?;
    let at = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("bad timestamp: {e}"))?
        .with_timezone(&Utc);

    let mut parts = payload.splitn(3, ';');
    let (Some(level), Some(source), Some(message)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err("expected level;source;message".to_string());
    };

    let level: Level = unescape(level)?.parse().map_err(|e| format!("{e}"))?;
    Ok(LogRecord::new(unescape(source)?, unescape(message)?, level, at))
}

fn escape_into(field: &str, escape_separator: bool, out: &mut String) {
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ';' if escape_separator => out.push_str("\\:"),
            c => out.push(c),
        }
    }
}

fn unescape(field: &str) -> Result<String, String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(':') => out.push(';'),
            Some(other) => return Err(format!("unknown escape \\{other}")),
            None => return Err("dangling escape".to_string()),
        }
    }
    Ok(out)
}
