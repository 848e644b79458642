//! HTTP and HTTPS listeners.
//!
//! - [`WebServer`] - lifecycle controller: config validation, start, close
//! - [`AddressSet`] - sanitized bind addresses per protocol
//! - [`ListenerRecord`] - one running listener and its shutdown handle
//! - [`FaultHandler`] - logs bind faults with the listener's address and port
//! - [`WsUpgrade`] - WebSocket upgrade honoring per-listener limits

mod address;
mod fault;
mod listener;
mod server;
mod shutdown;
mod websocket;

pub use address::AddressSet;
pub use fault::{FaultHandler, FaultKind};
pub use listener::{spawn_listener, ListenerRecord, Protocol};
pub use server::WebServer;
pub use shutdown::shutdown_signal;
pub use websocket::{WebSocketSupport, WsUpgrade};
