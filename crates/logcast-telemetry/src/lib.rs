mod layer;
pub mod tee;

pub use layer::{clamp_to_info, BroadcastLayer};
pub use tee::{LineAssembler, SharedTee, Tee};

use logcast_core::LineSink;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Targets whose events stay local. The broadcaster logs about its own
/// sends; forwarding those would feed every broadcast back into itself.
pub const INTERNAL_TARGETS: &[&str] = &["logcast_server", "logcast_telemetry"];

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level for local output. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Minimum level forwarded to remote observers. Never more verbose than INFO.
    pub broadcast_level: Level,
    /// Targets (and their submodules) never forwarded.
    pub excluded_targets: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            broadcast_level: Level::INFO,
            excluded_targets: INTERNAL_TARGETS.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Per-layer filter for the broadcast layer. Callsites more verbose than the
/// broadcast level are disabled for it before any event is built.
pub fn broadcast_filter(config: &TelemetryConfig) -> LevelFilter {
    LevelFilter::from_level(clamp_to_info(config.broadcast_level))
}

/// Build the broadcast layer described by `config`.
pub fn broadcast_layer<S: LineSink>(config: &TelemetryConfig, sink: S) -> BroadcastLayer<S> {
    BroadcastLayer::new(sink)
        .with_min_level(config.broadcast_level)
        .with_excluded_targets(config.excluded_targets.iter().cloned())
}

/// Install the global subscriber: local fmt output plus the broadcast layer.
///
/// Call once at startup, before any producer thread logs. Records from the
/// `log` crate are bridged in as well, so every logger in the process reaches
/// the broadcast layer through this single subscriber.
pub fn init_telemetry<S>(config: TelemetryConfig, sink: S) -> Result<(), TelemetryError>
where
    S: LineSink + 'static,
{
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer(&config, sink).with_filter(broadcast_filter(&config)))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)
}
