/// Environment variable names used by this crate for configuring the
/// producer transport and the collector.
///
/// These are purely helpers; the core types take explicit config structs.

/// Minimum level a producer forwards, e.g. `info`.
pub const LOG_RELAY_MIN_LEVEL_ENV: &str = "LOG_RELAY_MIN_LEVEL";

/// Source name stamped on every record a producer sends.
pub const LOG_RELAY_SOURCE_ENV: &str = "LOG_RELAY_SOURCE";

/// Path of the producer's fallback cache file.
pub const LOG_RELAY_FALLBACK_PATH_ENV: &str = "LOG_RELAY_FALLBACK_PATH";

/// Collector address a producer connects to, `host:port`.
pub const LOG_RELAY_COLLECTOR_ADDR_ENV: &str = "LOG_RELAY_COLLECTOR_ADDR";

/// Delay between reconnection attempts in milliseconds.
pub const LOG_RELAY_RECONNECT_MS_ENV: &str = "LOG_RELAY_RECONNECT_MS";

/// Address the collector listens on, `host:port`.
pub const LOG_RELAY_LISTEN_ADDR_ENV: &str = "LOG_RELAY_LISTEN_ADDR";

/// Comma-separated sink DSNs, e.g. `file:///var/log/relay.log,ws://0.0.0.0:9998`.
pub const LOG_RELAY_SINKS_ENV: &str = "LOG_RELAY_SINKS";

/// Line format: `plain`, `csv` or `fixed`.
pub const LOG_RELAY_FORMAT_ENV: &str = "LOG_RELAY_FORMAT";

/// Capacity of the dispatch queue.
pub const LOG_RELAY_QUEUE_CAPACITY_ENV: &str = "LOG_RELAY_QUEUE_CAPACITY";

/// Dispatch ordering: `arrival` or `created`.
pub const LOG_RELAY_QUEUE_ORDER_ENV: &str = "LOG_RELAY_QUEUE_ORDER";

/// Number of dispatcher workers.
pub const LOG_RELAY_DISPATCH_WORKERS_ENV: &str = "LOG_RELAY_DISPATCH_WORKERS";

/// Set to `json` for JSON diagnostics output from the collector.
pub const LOG_RELAY_LOG_FORMAT_ENV: &str = "LOG_RELAY_LOG_FORMAT";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Lookup function over the process environment, for `from_lookup` constructors.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
