use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::env::*;
use crate::error::ConfigError;
use crate::format::FormatKind;
use crate::pipeline::QueueOrder;
use crate::record::Level;

/// Settings for a producer's [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Records below this level are dropped before they reach the wire.
    pub minimum_level: Level,
    /// Identity stamped on every record.
    pub source: String,
    /// Where undeliverable records are parked.
    pub fallback_path: PathBuf,
    /// Collector address, `host:port`.
    pub collector_addr: String,
    /// Delay between reconnection attempts.
    pub reconnect_interval_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            minimum_level: Level::Info,
            source: "unknown".to_string(),
            fallback_path: PathBuf::from("log-relay-fallback.log"),
            collector_addr: "127.0.0.1:9999".to_string(),
            reconnect_interval_ms: 500,
        }
    }
}

impl ProducerConfig {
    pub fn new(
        minimum_level: Level,
        source: impl Into<String>,
        fallback_path: impl Into<PathBuf>,
        collector_addr: impl Into<String>,
    ) -> Self {
        Self {
            minimum_level,
            source: source.into(),
            fallback_path: fallback_path.into(),
            collector_addr: collector_addr.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    /// Build from a key lookup, falling back to defaults for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(level) = lookup(LOG_RELAY_MIN_LEVEL_ENV) {
            config.minimum_level = level
                .parse()
                .map_err(|e| ConfigError::invalid(LOG_RELAY_MIN_LEVEL_ENV, format!("{e}")))?;
        }
        if let Some(source) = lookup(LOG_RELAY_SOURCE_ENV) {
            config.source = source;
        }
        if let Some(path) = lookup(LOG_RELAY_FALLBACK_PATH_ENV) {
            config.fallback_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup(LOG_RELAY_COLLECTOR_ADDR_ENV) {
            config.collector_addr = addr;
        }
        if let Some(ms) = lookup(LOG_RELAY_RECONNECT_MS_ENV) {
            config.reconnect_interval_ms = parse_number(LOG_RELAY_RECONNECT_MS_ENV, &ms)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::invalid(LOG_RELAY_SOURCE_ENV, "source cannot be empty"));
        }
        validate_addr(LOG_RELAY_COLLECTOR_ADDR_ENV, &self.collector_addr, false)?;
        if self.reconnect_interval_ms == 0 {
            return Err(ConfigError::invalid(LOG_RELAY_RECONNECT_MS_ENV, "interval cannot be 0"));
        }
        Ok(())
    }
}

/// Settings for the [`Collector`](crate::collector::Collector).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Address to listen on, `host:port`; port 0 picks a free port.
    pub listen_addr: String,
    /// Sink DSNs, see [`parse_dsn`](crate::backend::parse_dsn).
    pub sinks: Vec<String>,
    pub format: FormatKind,
    /// Bound of the dispatch queue; decoders block when it is full.
    pub queue_capacity: usize,
    pub queue_order: QueueOrder,
    pub dispatch_workers: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9999".to_string(),
            sinks: vec!["file://log-relay.log".to_string()],
            format: FormatKind::Plain,
            queue_capacity: 1024,
            queue_order: QueueOrder::Arrival,
            dispatch_workers: 1,
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup(LOG_RELAY_LISTEN_ADDR_ENV) {
            config.listen_addr = addr;
        }
        if let Some(sinks) = lookup(LOG_RELAY_SINKS_ENV) {
            config.sinks = sinks
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(format) = lookup(LOG_RELAY_FORMAT_ENV) {
            config.format = format
                .parse()
                .map_err(|e| ConfigError::invalid(LOG_RELAY_FORMAT_ENV, format!("{e}")))?;
        }
        if let Some(capacity) = lookup(LOG_RELAY_QUEUE_CAPACITY_ENV) {
            config.queue_capacity = parse_number(LOG_RELAY_QUEUE_CAPACITY_ENV, &capacity)?;
        }
        if let Some(order) = lookup(LOG_RELAY_QUEUE_ORDER_ENV) {
            config.queue_order = order
                .parse()
                .map_err(|e| ConfigError::invalid(LOG_RELAY_QUEUE_ORDER_ENV, format!("{e}")))?;
        }
        if let Some(workers) = lookup(LOG_RELAY_DISPATCH_WORKERS_ENV) {
            config.dispatch_workers = parse_number(LOG_RELAY_DISPATCH_WORKERS_ENV, &workers)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_addr(LOG_RELAY_LISTEN_ADDR_ENV, &self.listen_addr, true)?;
        if self.sinks.is_empty() {
            return Err(ConfigError::invalid(LOG_RELAY_SINKS_ENV, "at least one sink is required"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid(LOG_RELAY_QUEUE_CAPACITY_ENV, "capacity cannot be 0"));
        }
        if self.dispatch_workers == 0 {
            return Err(ConfigError::invalid(LOG_RELAY_DISPATCH_WORKERS_ENV, "need at least one worker"));
        }
        Ok(())
    }
}

/// Diagnostics output of the collector process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            json: env_or(LOG_RELAY_LOG_FORMAT_ENV, "text") == "json",
        }
    }
}

fn validate_addr(key: &'static str, addr: &str, allow_port_zero: bool) -> Result<(), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::invalid(key, format!("expected host:port, got {addr:?}")))?;
    if host.trim().is_empty() {
        return Err(ConfigError::invalid(key, "host cannot be empty"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("invalid port {port:?}")))?;
    if port == 0 && !allow_port_zero {
        return Err(ConfigError::invalid(key, "port cannot be 0"));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("not a number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn producer_defaults_apply_to_missing_keys() {
        let config = ProducerConfig::from_lookup(lookup(&[(LOG_RELAY_SOURCE_ENV, "api-1")])).unwrap();
        assert_eq!(config.source, "api-1");
        assert_eq!(config.minimum_level, Level::Info);
        assert_eq!(config.reconnect_interval(), Duration::from_millis(500));
    }

    #[test]
    fn producer_rejects_bad_values() {
        assert!(ProducerConfig::from_lookup(lookup(&[(LOG_RELAY_MIN_LEVEL_ENV, "loud")])).is_err());
        assert!(ProducerConfig::from_lookup(lookup(&[(LOG_RELAY_COLLECTOR_ADDR_ENV, "nohost")])).is_err());
        assert!(ProducerConfig::from_lookup(lookup(&[(LOG_RELAY_COLLECTOR_ADDR_ENV, "h:0")])).is_err());
        assert!(ProducerConfig::from_lookup(lookup(&[(LOG_RELAY_SOURCE_ENV, "  ")])).is_err());
    }

    #[test]
    fn collector_reads_sinks_and_ordering() {
        let config = CollectorConfig::from_lookup(lookup(&[
            (LOG_RELAY_LISTEN_ADDR_ENV, "0.0.0.0:0"),
            (LOG_RELAY_SINKS_ENV, "file:///tmp/a.log, stdout://"),
            (LOG_RELAY_FORMAT_ENV, "csv"),
            (LOG_RELAY_QUEUE_ORDER_ENV, "created"),
            (LOG_RELAY_QUEUE_CAPACITY_ENV, "64"),
        ]))
        .unwrap();
        assert_eq!(config.sinks, ["file:///tmp/a.log", "stdout://"]);
        assert_eq!(config.format, FormatKind::Csv);
        assert_eq!(config.queue_order, QueueOrder::CreatedAt);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn collector_rejects_zero_capacity() {
        let err = CollectorConfig::from_lookup(lookup(&[(LOG_RELAY_QUEUE_CAPACITY_ENV, "0")])).unwrap_err();
        assert!(err.to_string().contains(LOG_RELAY_QUEUE_CAPACITY_ENV));
    }

    #[test]
    fn deserializes_from_json() {
        let config: ProducerConfig = serde_json::from_str(
            r#"{"minimum_level":"Warning","source":"batch","collector_addr":"logs:9999"}"#,
        )
        .unwrap();
        assert_eq!(config.minimum_level, Level::Warning);
        assert_eq!(config.fallback_path, PathBuf::from("log-relay-fallback.log"));
    }
}
