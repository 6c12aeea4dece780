pub mod record;
pub mod error;
pub mod wire;
pub mod env;
pub mod config;

pub mod cache;
pub mod transport;
pub mod layer;
pub mod init;

pub mod sink;
pub mod format;
pub mod file_sink;
pub mod broadcast;
pub mod stdout_sink;
pub mod noop_sink;
pub mod backend;

#[cfg(feature = "websocket")]
pub mod viewer;

pub mod pipeline;
pub mod decoder;
pub mod collector;

pub use collector::Collector;
pub use config::{CollectorConfig, ProducerConfig};
pub use record::{Level, LogRecord};
pub use sink::LogSink;
pub use transport::{ConnectionState, Transport};
