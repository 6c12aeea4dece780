use std::io;

/// Reasons a byte sequence is not a valid record frame.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown type tag {0:#04x}")]
    UnknownTag(u8),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown level ordinal {0}")]
    UnknownLevel(u8),

    #[error("nanosecond offset {0} out of range")]
    NanosOutOfRange(u32),

    #[error("timestamp {0}s out of range")]
    TimestampOutOfRange(i64),

    #[error("length prefix overflows")]
    LengthOverflow,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("trailing bytes after frame")]
    TrailingBytes,
}

/// Error type of the stream codec: either a bad frame or a failed socket.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the peer dropped the connection without a clean close.
    pub fn is_connection_reset(&self) -> bool {
        matches!(
            self,
            CodecError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("fallback cache I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt fallback cache entry {index}: {reason}")]
    Corrupt { index: usize, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid producer configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("write to collector failed: {0}")]
    Write(#[from] CodecError),

    /// Local durability is gone: the record could be neither sent nor cached.
    #[error("record could not be cached: {0}")]
    Cache(#[from] CacheError),

    #[error("transport is shut down")]
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind to address {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build sink: {0}")]
    Sink(String),

    #[error("server error: {0}")]
    Server(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
