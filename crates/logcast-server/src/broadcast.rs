use std::sync::Arc;
use std::time::Duration;

use logcast_core::{BridgeError, LineSink, LogLine, SendError};

use crate::client::{ClientConnection, ClientRegistry};
use crate::event_loop::LoopBridge;

/// Per-connection results of one delivered broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// What happened to one broadcast line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Nobody was connected; no send was attempted.
    NoClients,
    /// The line never reached the loop and is lost.
    Dropped(BridgeError),
    /// Every snapshot member was tried.
    Delivered(BroadcastReport),
}

/// Fans completed lines out to every connected client.
///
/// The hub reads the registry but never changes it: a connection whose send
/// fails stays registered until its own lifetime task notices the disconnect.
pub struct BroadcastHub {
    registry: Arc<ClientRegistry>,
    bridge: LoopBridge,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(registry: Arc<ClientRegistry>, bridge: LoopBridge, send_timeout: Duration) -> Self {
        Self {
            registry,
            bridge,
            send_timeout,
        }
    }

    /// Send `line` to every registered client and wait for all sends.
    ///
    /// Callable from any thread except the loop thread. Never fails: problems
    /// are reported in the returned outcome and otherwise only logged.
    pub fn broadcast(&self, line: &LogLine) -> BroadcastOutcome {
        let targets = self.registry.snapshot();
        if targets.is_empty() {
            tracing::trace!(line = %line, "no log clients connected, skipping broadcast");
            return BroadcastOutcome::NoClients;
        }

        let line = line.clone();
        let send_timeout = self.send_timeout;
        match self
            .bridge
            .submit_and_wait(move || deliver(targets, line, send_timeout))
        {
            Ok(report) => BroadcastOutcome::Delivered(report),
            Err(e) => {
                tracing::debug!(error = %e, "broadcast dropped");
                BroadcastOutcome::Dropped(e)
            }
        }
    }
}

impl LineSink for BroadcastHub {
    fn emit(&self, line: LogLine) {
        let _ = self.broadcast(&line);
    }
}

/// Send to all targets concurrently. Runs on the loop.
async fn deliver(
    targets: Vec<Arc<ClientConnection>>,
    line: LogLine,
    send_timeout: Duration,
) -> BroadcastReport {
    let sends = targets.iter().map(|conn| {
        let line = &line;
        async move {
            let result = match tokio::time::timeout(send_timeout, conn.send(line)).await {
                Ok(result) => result,
                Err(_) => Err(SendError::Timeout(send_timeout)),
            };
            (conn, result)
        }
    });
    let results = futures::future::join_all(sends).await;

    let mut report = BroadcastReport {
        attempted: results.len(),
        ..Default::default()
    };
    for (conn, result) in results {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                tracing::debug!(
                    client_id = %conn.id(),
                    kind = e.error_kind(),
                    error = %e,
                    "send to log client failed"
                );
            }
        }
    }
    report
}
