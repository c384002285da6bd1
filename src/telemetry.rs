//! Logging setup and the retrievable in-memory log sink.
//!
//! Everything in the crate logs through `tracing`. Besides the usual
//! stderr output, events are formatted into a fixed-capacity byte ring
//! that a diagnostic channel can drain remotely; when the ring overflows,
//! the oldest lines are dropped and the lost-byte count is reported with
//! the next retrieval instead of silently vanishing.

use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::ring::ByteRing;

/// Default capacity of the retrievable log ring.
pub const LOG_SINK_CAPACITY: usize = 16 * 1024;

/// Shared handle to the ring-buffered log. Cheap to clone; the diagnostic
/// side drains while the tracing layer appends.
#[derive(Clone)]
pub struct LogSink {
    ring: Arc<Mutex<ByteRing>>,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(ByteRing::new(capacity))),
        }
    }

    fn append(&self, line: &[u8]) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(line);
        }
    }

    /// Drain everything buffered since the last retrieval, together with
    /// the number of bytes lost to overflow in between.
    pub fn retrieve(&self) -> (String, u64) {
        let Ok(mut ring) = self.ring.lock() else {
            return (String::new(), 0);
        };
        let (bytes, lost) = ring.drain();
        (String::from_utf8_lossy(&bytes).into_owned(), lost)
    }

    pub fn buffered_len(&self) -> usize {
        self.ring.lock().map(|ring| ring.len()).unwrap_or(0)
    }
}

/// Tracing layer that renders each event as one line into the sink.
pub struct RingLayer {
    sink: LogSink,
}

impl RingLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, value.to_string());
    }
}

impl<S> Layer<S> for RingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let mut line = format!("{} {}", meta.level(), meta.target());
        if let Some(message) = &visitor.message {
            line.push_str(": ");
            line.push_str(message);
        }
        for (key, value) in &visitor.fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line.push('\n');
        self.sink.append(line.as_bytes());
    }
}

/// Install the global subscriber: compact stderr output plus the ring
/// sink, filtered by the `LOG` env var on top of a verbosity default.
/// Returns the sink handle for the diagnostic channel.
pub fn init(verbosity: u8) -> LogSink {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let sink = LogSink::new(LOG_SINK_CAPACITY);
    Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(RingLayer::new(sink.clone()))
        .with(filter)
        .init();
    sink
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}
