use crate::record::{Level, LogRecord};
use crate::transport::Transport;
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{warn, Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events from this crate's own modules are never forwarded, otherwise a
/// transport warning about a lost connection would feed back into the
/// transport.
const OWN_TARGET: &str = "log_relay";

/// `tracing_subscriber` layer that turns application events into
/// [`LogRecord`]s and ships them through a [`Transport`].
///
/// Events are handed to a background task over a bounded channel, so the
/// emitting thread never waits on the network or the fallback cache. The
/// transport applies its own minimum level on top of `minimum`.
pub struct RelayLayer {
    sender: mpsc::Sender<LogRecord>,
    minimum: Level,
    source: String,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully enqueued into channel.
    pub enqueued_events: Arc<AtomicU64>,
    /// Dropped because the channel was full.
    pub dropped_events: Arc<AtomicU64>,
}

impl RelayLayer {
    /// Create a new layer and spawn the task that forwards records to
    /// `transport`.
    ///
    /// `buffer` is clamped to at least 16 to avoid degenerate configs.
    pub fn new(transport: Transport, minimum: Level, buffer: usize) -> (Self, JoinHandle<()>) {
        let buffer = buffer.max(16);
        let (tx, mut rx) = mpsc::channel::<LogRecord>(buffer);

        let total_events = Arc::new(AtomicU64::new(0));
        let enqueued_events = Arc::new(AtomicU64::new(0));
        let dropped_events = Arc::new(AtomicU64::new(0));

        let source = transport.source().to_string();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = transport.send_record(record).await {
                    warn!(error = %e, "forwarded event lost");
                }
            }
        });

        (
            Self {
                sender: tx,
                minimum,
                source,
                total_events,
                enqueued_events,
                dropped_events,
            },
            handle,
        )
    }
}

/// Map a `tracing` level onto the four relay levels. TRACE folds into Debug.
pub fn relay_level(level: &tracing::Level) -> Level {
    if *level == tracing::Level::ERROR {
        Level::Error
    } else if *level == tracing::Level::WARN {
        Level::Warning
    } else if *level == tracing::Level::INFO {
        Level::Info
    } else {
        Level::Debug
    }
}

impl<S> Layer<S> for RelayLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let meta = event.metadata();
        if meta.target().starts_with(OWN_TARGET) {
            return;
        }
        let level = relay_level(meta.level());
        if !level.passes(self.minimum) {
            return;
        }

        let mut message = String::new();
        let mut fields = String::new();
        event.record(&mut FieldVisitor {
            message: &mut message,
            fields: &mut fields,
        });
        if !fields.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&fields);
        }

        let record = LogRecord::new(self.source.as_str(), message, level, Utc::now());
        match self.sender.try_send(record) {
            Ok(()) => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Collects the `message` field verbatim and renders every other field as
/// `key=value`, space separated.
pub struct FieldVisitor<'a> {
    pub message: &'a mut String,
    pub fields: &'a mut String,
}

impl FieldVisitor<'_> {
    fn push_field(&mut self, field: &Field, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field, format_args!("{value}"));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push_field(field, format_args!("{value}"));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push_field(field, format_args!("{value}"));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push_field(field, format_args!("{value}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_field(field, format_args!("{value:?}"));
        }
    }
}
