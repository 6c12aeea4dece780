use std::path::PathBuf;
use std::sync::Arc;

use crate::file_sink::FileSink;
use crate::format::LogFormat;
use crate::noop_sink::NoopSink;
use crate::sink::LogSink;
use crate::stdout_sink::StdoutSink;

#[cfg(feature = "websocket")]
use crate::viewer::ViewerServer;

/// Sink kinds that can be selected via DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Append-only file store at the given path.
    File(PathBuf),
    /// Live viewer broadcast served on the given `host:port`.
    Broadcast(String),
    Stdout,
    Noop,
}

/// Backend configuration built from a DSN.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Selected sink and its target.
    pub kind: BackendKind,
    /// Raw DSN that was used to construct this config.
    pub dsn: String,
}

impl BackendConfig {
    pub fn new(kind: BackendKind, dsn: impl Into<String>) -> Self {
        BackendConfig {
            kind,
            dsn: dsn.into(),
        }
    }
}

/// Parse a DSN string and infer the sink kind from its scheme.
///
/// Examples:
/// - "file:///var/log/relay.log" or "file://relay.log"
/// - "ws://0.0.0.0:8080"
/// - "stdout://"
/// - "noop://"
///
/// File paths may be percent-encoded ("file://my%20logs/relay.log").
pub fn parse_dsn(dsn: &str) -> Result<BackendConfig, DsnError> {
    let (scheme, rest) = dsn.split_once("://").ok_or(DsnError::UnknownScheme)?;

    let kind = match scheme.to_ascii_lowercase().as_str() {
        "file" => {
            if rest.is_empty() {
                return Err(DsnError::MissingTarget);
            }
            let path = urlencoding::decode(rest).map_err(|_| DsnError::InvalidEncoding)?;
            BackendKind::File(PathBuf::from(path.into_owned()))
        }
        "ws" => {
            let addr = rest.trim_end_matches('/');
            if addr.is_empty() {
                return Err(DsnError::MissingTarget);
            }
            BackendKind::Broadcast(addr.to_string())
        }
        "stdout" => BackendKind::Stdout,
        "noop" => BackendKind::Noop,
        _ => return Err(DsnError::UnknownScheme),
    };

    Ok(BackendConfig::new(kind, dsn))
}

/// Error type returned when parsing a DSN.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DsnError {
    #[error("unknown or unsupported DSN scheme")]
    UnknownScheme,

    #[error("DSN is missing its path or address")]
    MissingTarget,

    #[error("DSN path is not valid percent-encoded UTF-8")]
    InvalidEncoding,
}

/// Error type returned when building a sink from configuration.
#[derive(thiserror::Error, Debug)]
pub enum BackendBuildError {
    #[error("failed to open {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("websocket feature is not enabled")]
    WebsocketFeatureDisabled,
}

/// A constructed sink, plus the viewer endpoint that feeds it when the
/// sink is a live broadcast.
pub struct BuiltSink {
    pub sink: Arc<dyn LogSink>,
    #[cfg(feature = "websocket")]
    pub viewer: Option<ViewerServer>,
}

impl BuiltSink {
    fn plain(sink: Arc<dyn LogSink>) -> Self {
        BuiltSink {
            sink,
            #[cfg(feature = "websocket")]
            viewer: None,
        }
    }
}

/// Create a concrete `LogSink` from a `BackendConfig`.
///
/// This is the entry point for the collector binary, which selects its
/// sinks from a list of DSN strings rather than constructing them by hand.
pub async fn make_sink_from_config(
    cfg: &BackendConfig,
    format: Arc<dyn LogFormat>,
) -> Result<BuiltSink, BackendBuildError> {
    match &cfg.kind {
        BackendKind::File(path) => {
            let sink = FileSink::open(path.clone(), format)
                .await
                .map_err(|source| BackendBuildError::Io {
                    target: path.display().to_string(),
                    source,
                })?;
            Ok(BuiltSink::plain(Arc::new(sink)))
        }
        BackendKind::Broadcast(addr) => {
            #[cfg(feature = "websocket")]
            {
                use crate::broadcast::{BroadcastSink, ViewerHub};

                let hub = ViewerHub::new();
                let server = ViewerServer::bind(addr, Arc::clone(&hub))
                    .await
                    .map_err(|source| BackendBuildError::Io {
                        target: addr.clone(),
                        source,
                    })?;
                Ok(BuiltSink {
                    sink: Arc::new(BroadcastSink::new(format, hub)),
                    viewer: Some(server),
                })
            }

            #[cfg(not(feature = "websocket"))]
            {
                let _ = (addr, format);
                Err(BackendBuildError::WebsocketFeatureDisabled)
            }
        }
        BackendKind::Stdout => Ok(BuiltSink::plain(Arc::new(StdoutSink::new(format)))),
        BackendKind::Noop => Ok(BuiltSink::plain(Arc::new(NoopSink))),
    }
}
