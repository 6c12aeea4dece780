use crate::config::LoggingConfig;
use crate::layer::RelayLayer;
use crate::record::Level;
use crate::transport::Transport;
use tokio::task::JoinHandle;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Configuration of the producer-side tracing layer.
///
/// **Fields**
/// - `channel_buffer`: maximum number of records waiting for the transport
///   before new events are dropped.
/// - `minimum_level`: events below this level are not forwarded.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt` layer is
///   installed next to the [`RelayLayer`] so events also show up locally.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub channel_buffer: usize,
    pub minimum_level: Level,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1024,
            minimum_level: Level::Info,
            enable_stdout: true,
        }
    }
}

/// Install a global `tracing` subscriber that forwards events through
/// `transport`.
///
/// **Parameters**
/// - `transport`: connected producer [`Transport`].
/// - `config`: [`LayerConfig`] controlling buffering and filtering.
///
/// **Returns**
/// - the handle of the forwarding task, which ends once the subscriber is
///   dropped.
/// - `Err(..)` if a global subscriber was already installed.
pub fn init_tracing_with_config(
    transport: Transport,
    config: LayerConfig,
) -> Result<JoinHandle<()>, SetGlobalDefaultError> {
    let (layer, handle) = RelayLayer::new(transport, config.minimum_level, config.channel_buffer);

    // The two subscriber shapes have different types, so each branch
    // installs its own.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(handle)
}

/// Initialize producer tracing with [`LayerConfig::default`].
pub fn init_tracing(transport: Transport) -> Result<JoinHandle<()>, SetGlobalDefaultError> {
    init_tracing_with_config(transport, LayerConfig::default())
}

/// Diagnostics for the collector process itself: `RUST_LOG`-style
/// filtering (default `info`), human-readable or JSON lines.
pub fn init_collector_tracing(config: &LoggingConfig) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        let subscriber = Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    }
}
