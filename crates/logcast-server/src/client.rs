use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use logcast_core::{ClientId, LogLine, SendError};

/// Outbound half of one client's transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send_text(&self, text: &str) -> Result<(), SendError>;
}

/// One live client connection.
pub struct ClientConnection {
    id: ClientId,
    transport: Box<dyn Transport>,
    alive: AtomicBool,
}

impl ClientConnection {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_id(ClientId::new(), transport)
    }

    pub fn with_id(id: ClientId, transport: impl Transport + 'static) -> Self {
        Self {
            id,
            transport: Box::new(transport),
            alive: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn mark_closed(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Send one line as one text frame. A connection that has already gone
    /// through its disconnect path fails with [`SendError::Closed`].
    pub async fn send(&self, line: &LogLine) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.transport.send_text(line.as_str()).await
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Registry of all connected log clients.
///
/// Membership is changed only by connection lifecycle tasks on the event loop.
/// Broadcasters read it through [`ClientRegistry::snapshot`].
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Registering the same identity twice keeps the first
    /// entry and returns `false`.
    pub fn register(&self, conn: Arc<ClientConnection>) -> bool {
        let mut inserted = false;
        self.clients.entry(conn.id().clone()).or_insert_with(|| {
            inserted = true;
            conn
        });
        inserted
    }

    /// Remove a connection by ID. Removing an absent ID is a no-op that
    /// returns `false`.
    pub fn unregister(&self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    /// Owned copy of the current members, safe to iterate while the registry
    /// keeps changing.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// States of a connection's lifetime task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Registered,
    Reading,
    Disconnected,
    ReadError,
    Unregistered,
}

/// What the reader saw on the inbound half. Payloads carry no meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    Payload,
    Close,
}

/// Unregisters on drop, so the terminal state is reached exactly once even if
/// the lifetime task is cancelled mid-read.
struct Registration<'a> {
    conn: &'a ClientConnection,
    registry: &'a ClientRegistry,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.conn.mark_closed();
        self.registry.unregister(self.conn.id());
        tracing::info!(
            client_id = %self.conn.id(),
            state = ?ConnectionState::Unregistered,
            remaining = self.registry.count(),
            "log client disconnected"
        );
    }
}

/// Drive one connection from accept to unregistration.
///
/// Registers the connection, then reads and discards inbound frames until the
/// peer closes or the read fails. Returns the terminal cause,
/// [`ConnectionState::Disconnected`] or [`ConnectionState::ReadError`].
pub async fn run_connection<S, E>(
    conn: Arc<ClientConnection>,
    mut inbound: S,
    registry: &ClientRegistry,
) -> ConnectionState
where
    S: Stream<Item = Result<Inbound, E>> + Unpin,
    E: Display,
{
    tracing::trace!(client_id = %conn.id(), state = ?ConnectionState::Accepted, "connection accepted");

    registry.register(Arc::clone(&conn));
    let _registration = Registration {
        conn: &conn,
        registry,
    };
    tracing::info!(
        client_id = %conn.id(),
        state = ?ConnectionState::Registered,
        clients = registry.count(),
        "log client connected"
    );

    tracing::trace!(client_id = %conn.id(), state = ?ConnectionState::Reading, "reading");
    loop {
        match inbound.next().await {
            Some(Ok(Inbound::Payload)) => continue,
            Some(Ok(Inbound::Close)) | None => {
                tracing::debug!(client_id = %conn.id(), state = ?ConnectionState::Disconnected, "peer closed");
                return ConnectionState::Disconnected;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    client_id = %conn.id(),
                    state = ?ConnectionState::ReadError,
                    error = %e,
                    "error reading from log client"
                );
                return ConnectionState::ReadError;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::time::Duration;

    /// Records every frame it is asked to send.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) sent: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl RecordingTransport {
        pub(crate) fn frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_text(&self, text: &str) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(text.to_owned());
            Ok(())
        }
    }

    /// Fails every send.
    pub(crate) struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send_text(&self, _text: &str) -> Result<(), SendError> {
            Err(SendError::Transport("broken pipe".into()))
        }
    }

    /// Never completes a send within any reasonable time.
    pub(crate) struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send_text(&self, _text: &str) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }
}
