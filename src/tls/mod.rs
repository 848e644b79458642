//! TLS material loading and HTTPS listener context construction.
//!
//! - [`TlsMaterial`] - certificate, key, PFX, CA and CRL bytes read from disk
//! - [`build_server_config`] - turns material into a rustls `ServerConfig`
//! - [`construct_with_recovery`] - retries construction with operator-supplied
//!   passphrases after decryption failures

mod context;
mod material;
mod passphrase;

pub use context::{build_server_config, TlsContextError};
pub use material::{KeySource, LoadedFile, ProtocolFloor, TlsMaterial};
pub use passphrase::{
    construct_with_recovery, PassphrasePrompt, PassphraseReader, Recovered, TerminalPrompt,
};
