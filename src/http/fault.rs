//! Per-listener runtime fault reporting.
//!
//! A failed bind never tells us which address and port it was for, so each
//! listener carries its own handler with that context. Faults are logged and
//! swallowed; the listener is not closed or rebound.

use std::io;

use super::listener::Protocol;

/// Classes of runtime bind fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Another process holds the address/port
    AddressInUse,
    /// The address does not exist or does not belong to this host
    AddressUnavailable,
    Other,
}

impl FaultKind {
    pub fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::AddrNotAvailable => Self::AddressUnavailable,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaultHandler {
    protocol: Protocol,
    address: String,
    port: u16,
}

impl FaultHandler {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            address: address.into(),
            port,
        }
    }

    /// Log a fault for this listener and return how it was classified.
    pub fn handle(&self, error: &io::Error) -> FaultKind {
        let kind = FaultKind::classify(error);
        match kind {
            FaultKind::AddressInUse => {
                tracing::error!(
                    protocol = %self.protocol,
                    address = %self.address,
                    port = self.port,
                    "Could not listen on address, it is already in use by another process"
                );
            }
            FaultKind::AddressUnavailable => {
                tracing::error!(
                    protocol = %self.protocol,
                    address = %self.address,
                    port = self.port,
                    error = %error,
                    "Could not listen on address, invalid IP for this system"
                );
            }
            FaultKind::Other => {
                tracing::warn!(
                    protocol = %self.protocol,
                    address = %self.address,
                    port = self.port,
                    error = %error,
                    details = ?error,
                    "Unexpected error on server"
                );
            }
        }
        kind
    }
}
