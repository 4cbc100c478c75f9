use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use logcast_server::{BroadcastHub, ClientRegistry, LoopBridge, ServerConfig};
use logcast_telemetry::{tee, TelemetryConfig};

/// Themes the hosted UI understands. Only validated here.
const UI_THEMES: &[&str] = &[
    "Default",
    "Soft",
    "Monochrome",
    "Glass",
    "Origin",
    "Citrus",
    "Ocean",
    "Base",
];

#[derive(Parser, Debug)]
#[command(name = "logcast", about = "Stream live console and log output to WebSocket observers")]
struct Cli {
    /// Host the log endpoint binds to.
    #[arg(long, env = "LOGCAST_WS_HOST", default_value = "0.0.0.0")]
    ws_host: String,

    /// Port the log endpoint binds to.
    #[arg(long, env = "LOGCAST_WS_PORT", default_value_t = 7789)]
    ws_port: u16,

    /// Upper bound on one send to one client, in milliseconds.
    #[arg(long, env = "LOGCAST_SEND_TIMEOUT_MS", default_value_t = 5000)]
    send_timeout_ms: u64,

    /// IP address the UI binds to.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Port the UI listens on.
    #[arg(long, default_value_t = 7788)]
    port: u16,

    /// Theme to use for the UI.
    #[arg(long, default_value = "Ocean", value_parser = clap::builder::PossibleValuesParser::new(UI_THEMES.iter().copied()))]
    theme: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = ServerConfig {
        host: cli.ws_host.clone(),
        port: cli.ws_port,
        send_timeout: Duration::from_millis(cli.send_timeout_ms),
        ..Default::default()
    };

    let registry = Arc::new(ClientRegistry::new());
    let bridge = LoopBridge::new();
    let hub = Arc::new(BroadcastHub::new(
        Arc::clone(&registry),
        bridge.clone(),
        config.send_timeout,
    ));

    logcast_telemetry::init_telemetry(TelemetryConfig::default(), Arc::clone(&hub))
        .context("failed to install tracing subscriber")?;

    let handle = logcast_server::start(&config, registry, bridge)
        .with_context(|| format!("failed to start log endpoint on {}", config.bind_addr()))?;
    tracing::info!(addr = %handle.local_addr(), "log endpoint ready at ws://{}", handle.local_addr());

    tracing::info!(
        ui = %format!("http://{}:{}", cli.ip, cli.port),
        theme = %cli.theme,
        "UI settings accepted; the UI host is mounted separately"
    );

    let mut stdout = tee::stdout(Arc::clone(&hub));
    let mut stderr = tee::stderr(Arc::clone(&hub));
    writeln!(stdout, "[MAIN] log broadcaster running, press Ctrl-C to stop")
        .context("failed to write to stdout")?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        writeln!(stderr, "[MAIN] failed to listen for ctrl+c: {e}")
            .context("failed to write to stderr")?;
        return Err(e).context("failed to listen for ctrl+c");
    }

    writeln!(stderr, "[MAIN] received Ctrl-C, shutting down")
        .context("failed to write to stderr")?;
    tracing::info!("Shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["logcast"]).unwrap();
        assert_eq!(cli.ws_port, 7789);
        assert_eq!(cli.port, 7788);
        assert_eq!(cli.theme, "Ocean");
    }

    #[test]
    fn cli_rejects_unknown_theme() {
        assert!(Cli::try_parse_from(["logcast", "--theme", "Neon"]).is_err());
        assert!(Cli::try_parse_from(["logcast", "--theme", "Soft"]).is_ok());
    }
}
