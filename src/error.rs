use std::io;
use std::path::PathBuf;

use crate::tls::TlsContextError;

/// Errors surfaced by the web server lifecycle.
///
/// Runtime bind faults are not represented here: they are reported through the
/// per-listener fault handler and only logged.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Server has not been configured")]
    NotConfigured,

    #[error("Failed to read TLS material from {}: {source}", path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to construct HTTPS listener: {0}")]
    ListenerConstruction(#[source] TlsContextError),

    #[error("Failed to read passphrase: {0}")]
    PassphraseInput(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
