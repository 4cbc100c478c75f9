pub mod broadcast;
pub mod client;
pub mod event_loop;
pub mod server;

pub use broadcast::{BroadcastHub, BroadcastOutcome, BroadcastReport};
pub use client::{ClientConnection, ClientRegistry, ConnectionState, Inbound, Transport};
pub use event_loop::{LoopBridge, LoopState};
pub use server::{ServerConfig, ServerError, ServerHandle, start};
