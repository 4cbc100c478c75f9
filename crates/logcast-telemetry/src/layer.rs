use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};

use chrono::Local;
use logcast_core::{LineSink, LogLine};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use tracing_log::NormalizeEvent;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

thread_local! {
    static IN_ADAPTER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside [`BroadcastLayer::on_event`].
struct AdapterGuard;

impl AdapterGuard {
    fn enter() -> Option<Self> {
        IN_ADAPTER.with(|flag| if flag.replace(true) { None } else { Some(Self) })
    }
}

impl Drop for AdapterGuard {
    fn drop(&mut self) {
        IN_ADAPTER.with(|flag| flag.set(false));
    }
}

/// Never more verbose than INFO.
pub fn clamp_to_info(level: Level) -> Level {
    if level > Level::INFO {
        Level::INFO
    } else {
        level
    }
}

/// tracing Layer that formats each event once and hands it to a [`LineSink`].
///
/// Every event passes through a layer exactly once, whatever its target, so
/// no per-target bookkeeping is needed to avoid duplicates. Events below the
/// minimum level, events from excluded targets, and events raised while this
/// thread is already inside the layer are skipped.
pub struct BroadcastLayer<S> {
    sink: S,
    min_level: Level,
    excluded_targets: Vec<String>,
}

impl<S: LineSink> BroadcastLayer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            min_level: Level::INFO,
            excluded_targets: Vec::new(),
        }
    }

    /// Levels more verbose than INFO are raised to INFO.
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = clamp_to_info(level);
        self
    }

    /// Skip events whose target is one of `targets` or a submodule of one.
    pub fn with_excluded_targets<I, T>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.excluded_targets
            .extend(targets.into_iter().map(Into::into));
        self
    }

    fn is_excluded(&self, target: &str) -> bool {
        self.excluded_targets.iter().any(|prefix| {
            target
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
        })
    }

    /// Emit one line per non-blank piece of `record`, each behind the header.
    fn forward(&self, record: &FormattedRecord) {
        for raw in record.body.split('\n') {
            if raw.trim().is_empty() {
                continue;
            }
            let Some(line) = LogLine::new(&format!("{}{}", record.header, raw.trim())) else {
                continue;
            };
            if panic::catch_unwind(AssertUnwindSafe(|| self.sink.emit(line))).is_err() {
                eprintln!("logcast-telemetry: line sink panicked, log record dropped");
            }
        }
    }
}

impl<S, Sub> Layer<Sub> for BroadcastLayer<S>
where
    S: LineSink + 'static,
    Sub: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, Sub>) {
        // Records bridged from the `log` crate carry their real target and
        // level in `log.*` fields.
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());
        if *metadata.level() > self.min_level || self.is_excluded(metadata.target()) {
            return;
        }
        let Some(_guard) = AdapterGuard::enter() else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| format_record(event, metadata))) {
            Ok(Ok(record)) => self.forward(&record),
            Ok(Err(e)) => eprintln!("logcast-telemetry: failed to format log record: {e}"),
            Err(_) => eprintln!("logcast-telemetry: formatting panicked, log record dropped"),
        }
    }
}

/// Collects the message and the remaining fields of one event.
///
/// A field whose `Debug` impl fails is remembered rather than panicking;
/// the record is then dropped as a whole.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
    error: Option<fmt::Error>,
}

impl RecordVisitor {
    fn finish(self) -> Result<Self, fmt::Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_owned(),
            name if name.starts_with("log.") => {}
            name => self.fields.push((name, value.to_owned())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let name = field.name();
        if name.starts_with("log.") || self.error.is_some() {
            return;
        }
        let mut text = String::new();
        if let Err(e) = write!(text, "{value:?}") {
            self.error = Some(e);
            return;
        }
        if name == "message" {
            self.message = text;
        } else {
            self.fields.push((name, text));
        }
    }
}

/// One event rendered as `<timestamp> - <LEVEL> - <target> - ` plus
/// `<message> [key=value ...]`.
struct FormattedRecord {
    header: String,
    body: String,
}

fn format_record(
    event: &Event<'_>,
    metadata: &Metadata<'_>,
) -> Result<FormattedRecord, fmt::Error> {
    let mut visitor = RecordVisitor::default();
    event.record(&mut visitor);
    let visitor = visitor.finish()?;

    let mut header = String::new();
    write!(
        header,
        "{} - {} - {} - ",
        Local::now().format(TIMESTAMP_FORMAT),
        metadata.level(),
        metadata.target(),
    )?;
    let mut body = visitor.message;
    for (name, value) in &visitor.fields {
        write!(body, " {name}={value}")?;
    }
    Ok(FormattedRecord { header, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use logcast_core::CollectingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    fn with_layer<S: LineSink + 'static>(layer: BroadcastLayer<S>, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
    }

    /// Counts invocations and logs from inside `emit`.
    #[derive(Clone, Default)]
    struct ChattySink {
        calls: Arc<AtomicUsize>,
    }

    impl LineSink for ChattySink {
        fn emit(&self, _line: LogLine) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tracing::info!(target: "app", "logged from inside the sink");
        }
    }

    struct PanickingSink;

    impl LineSink for PanickingSink {
        fn emit(&self, _line: LogLine) {
            panic!("sink exploded");
        }
    }

    #[test]
    fn one_line_per_event_regardless_of_nesting() {
        let sink = CollectingSink::new();
        with_layer(BroadcastLayer::new(sink.clone()), || {
            tracing::info!(target: "app", "root");
            tracing::info!(target: "app::db", "child");
            tracing::info!(target: "app::db::pool", "grandchild");
        });

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - INFO - app - root"));
        assert!(lines[1].ends_with(" - INFO - app::db - child"));
        assert!(lines[2].ends_with(" - INFO - app::db::pool - grandchild"));
    }

    #[test]
    fn below_info_is_skipped() {
        let sink = CollectingSink::new();
        with_layer(
            BroadcastLayer::new(sink.clone()).with_min_level(Level::TRACE),
            || {
                tracing::debug!(target: "app", "debug");
                tracing::trace!(target: "app", "trace");
                tracing::warn!(target: "app", "warn");
            },
        );
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(" - WARN - app - warn"));
    }

    #[test]
    fn stricter_level_is_kept() {
        let sink = CollectingSink::new();
        with_layer(
            BroadcastLayer::new(sink.clone()).with_min_level(Level::WARN),
            || {
                tracing::info!(target: "app", "info");
                tracing::error!(target: "app", "error");
            },
        );
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn excluded_targets_are_skipped() {
        let sink = CollectingSink::new();
        let layer = BroadcastLayer::new(sink.clone()).with_excluded_targets(["logcast_server"]);
        with_layer(layer, || {
            tracing::info!(target: "logcast_server", "exact");
            tracing::info!(target: "logcast_server::broadcast", "child");
            tracing::info!(target: "logcast_server_extra", "not a child");
        });
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("logcast_server_extra - not a child"));
    }

    #[test]
    fn fields_are_appended() {
        let sink = CollectingSink::new();
        with_layer(BroadcastLayer::new(sink.clone()), || {
            tracing::info!(target: "app", user = "ann", attempts = 3, "signed in");
        });
        let lines = sink.lines();
        assert!(lines[0].ends_with(" - INFO - app - signed in user=ann attempts=3"));
    }

    #[test]
    fn timestamp_prefix_shape() {
        let sink = CollectingSink::new();
        with_layer(BroadcastLayer::new(sink.clone()), || {
            tracing::info!(target: "app", "x");
        });
        let line = &sink.lines()[0];
        let stamp = line.split(" - ").next().unwrap();
        // 2024-01-01 12:00:00,123
        assert_eq!(stamp.len(), 23);
        assert_eq!(&stamp[19..20], ",");
    }

    #[test]
    fn multi_line_message_becomes_several_lines() {
        let sink = CollectingSink::new();
        with_layer(BroadcastLayer::new(sink.clone()), || {
            tracing::error!(target: "app", "failed:\n  cause one\n\n  cause two");
        });
        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - ERROR - app - failed:"));
        assert!(lines[1].ends_with(" - ERROR - app - cause one"));
        assert!(lines[2].ends_with(" - ERROR - app - cause two"));
        // Every piece of one record shares its timestamp.
        let stamp = |line: &str| line.split(" - ").next().unwrap().to_owned();
        assert_eq!(stamp(&lines[0]), stamp(&lines[1]));
        assert_eq!(stamp(&lines[0]), stamp(&lines[2]));
    }

    #[test]
    fn logging_inside_sink_does_not_recurse() {
        let sink = ChattySink::default();
        with_layer(BroadcastLayer::new(sink.clone()), || {
            tracing::info!(target: "app", "outer");
        });
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_sink_is_contained() {
        with_layer(BroadcastLayer::new(PanickingSink), || {
            tracing::info!(target: "app", "first");
            tracing::info!(target: "app", "second");
        });
        // The guard was released after the panic, so the layer still runs.
        let sink = CollectingSink::new();
        with_layer(BroadcastLayer::new(sink.clone()), || {
            tracing::info!(target: "app", "after");
        });
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn failing_debug_field_drops_only_that_record() {
        struct BadDebug;

        impl fmt::Debug for BadDebug {
            fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Err(fmt::Error)
            }
        }

        let sink = CollectingSink::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            with_layer(BroadcastLayer::new(sink.clone()), || {
                tracing::info!(target: "app", bad = ?BadDebug, "x");
                tracing::info!(target: "app", "{:?}", BadDebug);
                tracing::info!(target: "app", "still flowing");
            });
        }));

        assert!(outcome.is_ok(), "formatting failure reached the caller");
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" - INFO - app - still flowing"));
    }

    #[test]
    fn log_crate_records_use_their_own_target() {
        let sink = CollectingSink::new();
        let layer = BroadcastLayer::new(sink.clone()).with_excluded_targets(["logcast_server"]);
        with_layer(layer, || {
            tracing_log::format_trace(
                &log::Record::builder()
                    .args(format_args!("hello from log"))
                    .level(log::Level::Info)
                    .target("myapp::db")
                    .module_path_static(Some("myapp::db"))
                    .file_static(Some("db.rs"))
                    .line(Some(12))
                    .build(),
            )
            .unwrap();
            tracing_log::format_trace(
                &log::Record::builder()
                    .args(format_args!("internal"))
                    .level(log::Level::Info)
                    .target("logcast_server::broadcast")
                    .build(),
            )
            .unwrap();
            tracing_log::format_trace(
                &log::Record::builder()
                    .args(format_args!("too chatty"))
                    .level(log::Level::Debug)
                    .target("myapp::db")
                    .build(),
            )
            .unwrap();
        });

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" - INFO - myapp::db - hello from log"));
        assert!(!lines[0].contains("log."));
    }

    #[test]
    fn clamp_never_below_info() {
        assert_eq!(clamp_to_info(Level::TRACE), Level::INFO);
        assert_eq!(clamp_to_info(Level::DEBUG), Level::INFO);
        assert_eq!(clamp_to_info(Level::INFO), Level::INFO);
        assert_eq!(clamp_to_info(Level::ERROR), Level::ERROR);
    }
}
