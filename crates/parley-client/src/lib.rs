//! WebSocket client for the relay: connects, authenticates, exchanges
//! frames, and reconnects with exponential backoff when the connection
//! drops unexpectedly.

pub mod backoff;
pub mod client;

pub use backoff::ReconnectPolicy;
pub use client::{ClientConfig, ClientEvent, ClientState, RelayClient};
