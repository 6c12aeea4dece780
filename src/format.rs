use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;

use crate::record::LogRecord;

/// Turns a record into one line of text (without the trailing newline).
pub trait LogFormat: Send + Sync {
    fn format(&self, record: &LogRecord) -> String;
}

/// Built-in formats selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    #[default]
    Plain,
    Csv,
    FixedWidth,
}

impl FormatKind {
    pub fn build(self) -> Arc<dyn LogFormat> {
        match self {
            FormatKind::Plain => Arc::new(PlainText),
            FormatKind::Csv => Arc::new(Csv),
            FormatKind::FixedWidth => Arc::new(FixedWidth),
        }
    }
}

impl FromStr for FormatKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(FormatKind::Plain),
            "csv" => Ok(FormatKind::Csv),
            "fixed" | "fixed_width" | "fixed-width" => Ok(FormatKind::FixedWidth),
            other => Err(format!("unknown format {other:?}")),
        }
    }
}

/// `[2024-05-01T12:00:00.500Z] [Info] billing-7: payment failed`
///
/// Line breaks in source and message are written as `\n` / `\r`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl LogFormat for PlainText {
    fn format(&self, record: &LogRecord) -> String {
        format!(
            "[{}] [{}] {}: {}",
            iso_instant(record.created_at()),
            record.level(),
            escape_line_breaks(record.source()),
            escape_line_breaks(record.message())
        )
    }
}

/// `timestamp,level,source,message` with RFC 4180 quoting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Csv;

impl LogFormat for Csv {
    fn format(&self, record: &LogRecord) -> String {
        let fields = [
            csv_field(&iso_instant(record.created_at())),
            csv_field(record.level().as_str()),
            csv_field(record.source()),
            csv_field(record.message()),
        ];
        fields.join(",")
    }
}

/// `2024-05-01 12:00:00.5000 INFO billing-7 payment failed`, UTC with
/// four fractional digits so columns line up.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWidth;

impl LogFormat for FixedWidth {
    fn format(&self, record: &LogRecord) -> String {
        let at = record.created_at();
        format!(
            "{}.{:04} {} {} {}",
            at.format("%Y-%m-%d %H:%M:%S"),
            at.timestamp_subsec_nanos().min(999_999_999) / 100_000,
            record.level().as_str().to_uppercase(),
            escape_line_breaks(record.source()),
            escape_line_breaks(record.message())
        )
    }
}

fn iso_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Backslash-escape `\\`, LF and CR so the text stays on one line.
pub fn escape_line_breaks(input: &str) -> Cow<'_, str> {
    if !input.contains(['\\', '\n', '\r']) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 4);
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Quote a field if it contains a comma, quote, CR or LF; inner quotes are doubled.
pub fn csv_field(input: &str) -> String {
    if input.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", input.replace('"', "\"\""))
    } else {
        input.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Level;
    use chrono::TimeZone;

    fn record(message: &str) -> LogRecord {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(500);
        LogRecord::new("billing-7", message, Level::Info, at)
    }

    #[test]
    fn plain_text_line() {
        assert_eq!(
            PlainText.format(&record("payment failed")),
            "[2024-05-01T12:00:00.500Z] [Info] billing-7: payment failed"
        );
    }

    #[test]
    fn csv_quotes_and_doubles_quotes() {
        assert_eq!(csv_field(r#"hello, "world""#), r#""hello, ""world""""#);
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");

        assert_eq!(
            Csv.format(&record(r#"hello, "world""#)),
            r#"2024-05-01T12:00:00.500Z,Info,billing-7,"hello, ""world""""#
        );
    }

    #[test]
    fn fixed_width_line() {
        assert_eq!(
            FixedWidth.format(&record("payment failed")),
            "2024-05-01 12:00:00.5000 INFO billing-7 payment failed"
        );
    }

    #[test]
    fn line_formats_keep_one_record_per_line() {
        let multi = record("first\nsecond\r\nC:\\tmp");
        assert_eq!(
            PlainText.format(&multi),
            "[2024-05-01T12:00:00.500Z] [Info] billing-7: first\\nsecond\\r\\nC:\\\\tmp"
        );
        let fixed = FixedWidth.format(&multi);
        assert!(!fixed.contains(['\n', '\r']));
        assert!(fixed.ends_with("billing-7 first\\nsecond\\r\\nC:\\\\tmp"));
        assert!(matches!(escape_line_breaks("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn kinds_parse_and_build() {
        assert_eq!("CSV".parse::<FormatKind>(), Ok(FormatKind::Csv));
        assert_eq!("fixed".parse::<FormatKind>(), Ok(FormatKind::FixedWidth));
        assert!("xml".parse::<FormatKind>().is_err());
        assert!(FormatKind::Plain.build().format(&record("x")).contains("[Info]"));
    }
}
