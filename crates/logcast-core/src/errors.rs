use std::time::Duration;

/// Failure delivering one line to one connection.
///
/// Always isolated to that connection: it never aborts a broadcast and never
/// removes the connection from the registry by itself.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure handing work to the event loop thread.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// No loop has published its handle yet.
    #[error("event loop not started")]
    LoopUnavailable,

    /// The loop was running but its thread has exited.
    #[error("event loop has shut down")]
    LoopClosed,

    /// The submitted work panicked or was dropped before replying.
    #[error("submitted work aborted before completing")]
    WorkAborted,

    /// Called from the loop thread itself, where blocking would deadlock.
    #[error("submit_and_wait called from the event loop thread")]
    Reentrant,
}

impl SendError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_display() {
        let e = SendError::Timeout(Duration::from_millis(250));
        assert_eq!(e.to_string(), "send timed out after 250ms");
        assert_eq!(e.error_kind(), "timeout");
        assert_eq!(SendError::Closed.error_kind(), "closed");
    }

    #[test]
    fn bridge_error_display() {
        assert_eq!(
            BridgeError::LoopUnavailable.to_string(),
            "event loop not started"
        );
    }
}
