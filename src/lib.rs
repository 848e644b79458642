//! Portico - multi-listener HTTP/HTTPS front end.
//!
//! Binds one listener per configured (protocol, address) pair, serves an axum
//! app on each, asks for a key passphrase when encrypted TLS material cannot be
//! decrypted, and shuts all listeners down together.

pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod plugins;
pub mod routes;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use http::WebServer;
