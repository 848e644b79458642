//! Interactive passphrase recovery for encrypted HTTPS keys.
//!
//! Listener construction is retried for as long as it fails with a decryption
//! failure, asking the operator for a new passphrase each time. There is no
//! retry cap: a deployment without a terminal must put the passphrase in the
//! configuration, otherwise startup waits on the prompt forever.

use std::io;

use async_trait::async_trait;

use crate::config::PASSPHRASE_PROMPT;
use crate::error::ServerError;

use super::{TlsContextError, TlsMaterial};

/// Opens an input channel for passphrase entry.
#[async_trait]
pub trait PassphrasePrompt: Send + Sync {
    async fn open(&self) -> io::Result<Box<dyn PassphraseReader>>;
}

/// An open input channel. Dropping it closes the channel.
#[async_trait]
pub trait PassphraseReader: Send {
    async fn read_passphrase(&mut self, message: &str) -> io::Result<String>;
}

/// Reads the passphrase from the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl PassphrasePrompt for TerminalPrompt {
    async fn open(&self) -> io::Result<Box<dyn PassphraseReader>> {
        tracing::debug!("Opening terminal for passphrase entry");
        Ok(Box::new(TerminalReader))
    }
}

struct TerminalReader;

#[async_trait]
impl PassphraseReader for TerminalReader {
    async fn read_passphrase(&mut self, message: &str) -> io::Result<String> {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || rpassword::prompt_password(message))
            .await
            .map_err(io::Error::other)?
    }
}

impl Drop for TerminalReader {
    fn drop(&mut self) {
        tracing::debug!("Closed passphrase prompt");
    }
}

/// States of one HTTPS listener construction.
enum RecoveryState<T> {
    Idle,
    Attempting,
    AwaitingPassphrase,
    Bound(T),
    Failed(ServerError),
}

impl<T> RecoveryState<T> {
    fn name(&self) -> &'static str {
        match self {
            RecoveryState::Idle => "idle",
            RecoveryState::Attempting => "attempting",
            RecoveryState::AwaitingPassphrase => "awaiting passphrase",
            RecoveryState::Bound(_) => "bound",
            RecoveryState::Failed(_) => "failed",
        }
    }
}

/// Result of a successful construction, with the material that produced it.
#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub material: TlsMaterial,
    pub attempts: usize,
}

/// Run `construct` until it succeeds, prompting for a passphrase after every
/// decryption failure. Any other failure ends the loop and is returned as
/// [`ServerError::ListenerConstruction`].
pub async fn construct_with_recovery<T, F>(
    material: TlsMaterial,
    prompt: &dyn PassphrasePrompt,
    mut construct: F,
) -> Result<Recovered<T>, ServerError>
where
    F: FnMut(&TlsMaterial) -> Result<T, TlsContextError>,
{
    let mut material = material;
    let mut state = RecoveryState::Idle;
    let mut attempts = 0;

    loop {
        tracing::trace!(state = state.name(), attempts, "HTTPS listener construction state");
        state = match state {
            RecoveryState::Idle => RecoveryState::Attempting,
            RecoveryState::Attempting => {
                attempts += 1;
                match construct(&material) {
                    Ok(value) => RecoveryState::Bound(value),
                    Err(e) if e.is_decryption_failure() => {
                        tracing::warn!(
                            attempt = attempts,
                            error = %e,
                            "HTTPS key decryption failed"
                        );
                        RecoveryState::AwaitingPassphrase
                    }
                    Err(e) => RecoveryState::Failed(ServerError::ListenerConstruction(e)),
                }
            }
            RecoveryState::AwaitingPassphrase => match read_passphrase(prompt).await {
                Ok(passphrase) => {
                    material = material.with_passphrase(passphrase);
                    RecoveryState::Attempting
                }
                Err(e) => RecoveryState::Failed(ServerError::PassphraseInput(e)),
            },
            RecoveryState::Bound(value) => {
                return Ok(Recovered {
                    value,
                    material,
                    attempts,
                })
            }
            RecoveryState::Failed(e) => return Err(e),
        };
    }
}

/// The reader is dropped, and so closed, before this returns on every path.
async fn read_passphrase(prompt: &dyn PassphrasePrompt) -> io::Result<String> {
    let mut reader = prompt.open().await?;
    reader.read_passphrase(PASSPHRASE_PROMPT).await
}
