//! WebSocket relay server: connection sessions, presence registry,
//! and the message relay router.

pub mod presence;
pub mod relay;
pub mod server;
pub mod session;

pub use server::{start, RelayDeps, ServerConfig, ServerHandle};
