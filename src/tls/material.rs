//! TLS material read from disk, plus the resolved protocol floor.

use std::fmt;
use std::path::{Path, PathBuf};

use rustls::SupportedProtocolVersion;

use crate::config::{HttpsConfig, DEFAULT_SECURE_OPTIONS, SSL_OP_NO_TLSV1_2, SSL_OP_NO_TLSV1_3};
use crate::error::ServerError;

use super::TlsContextError;

/// Minimum protocol restriction for an HTTPS listener.
///
/// Either an OpenSSL `SSL_OP_*` bitmask or an OpenSSL method name, kept verbatim
/// from configuration and interpreted when the listener is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFloor {
    SecureOptions(u64),
    SecureProtocol(String),
}

impl ProtocolFloor {
    /// Resolve the floor for an HTTPS config: explicit `secure_options` first,
    /// then explicit `secure_protocol`, then the TLS 1.2 default.
    pub fn resolve(config: &HttpsConfig) -> Self {
        if let Some(options) = config.secure_options {
            Self::SecureOptions(options)
        } else if let Some(protocol) = &config.secure_protocol {
            Self::SecureProtocol(protocol.clone())
        } else {
            Self::SecureOptions(DEFAULT_SECURE_OPTIONS)
        }
    }

    /// TLS versions the listener may negotiate under this floor.
    pub fn protocol_versions(
        &self,
    ) -> Result<Vec<&'static SupportedProtocolVersion>, TlsContextError> {
        match self {
            Self::SecureOptions(options) => {
                let mut versions = Vec::with_capacity(2);
                if options & SSL_OP_NO_TLSV1_3 == 0 {
                    versions.push(&rustls::version::TLS13);
                }
                if options & SSL_OP_NO_TLSV1_2 == 0 {
                    versions.push(&rustls::version::TLS12);
                }
                if versions.is_empty() {
                    return Err(TlsContextError::NoProtocolVersions(*options));
                }
                Ok(versions)
            }
            Self::SecureProtocol(method) => match method.as_str() {
                "TLS_method" | "TLS_server_method" | "SSLv23_method" | "SSLv23_server_method" => {
                    Ok(vec![&rustls::version::TLS13, &rustls::version::TLS12])
                }
                "TLSv1_2_method" | "TLSv1_2_server_method" => Ok(vec![&rustls::version::TLS12]),
                "TLSv1_3_method" | "TLSv1_3_server_method" => Ok(vec![&rustls::version::TLS13]),
                other => Err(TlsContextError::UnsupportedProtocol(other.to_string())),
            },
        }
    }
}

/// Raw contents of one TLS file, kept with its path for diagnostics.
#[derive(Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

impl LoadedFile {
    pub fn read(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read(path).map_err(|source| ServerError::KeyRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    fn read_all(paths: &[PathBuf]) -> Result<Vec<Self>, ServerError> {
        paths.iter().map(|path| Self::read(path)).collect()
    }
}

impl fmt::Debug for LoadedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedFile")
            .field("path", &self.path)
            .field("len", &self.contents.len())
            .finish()
    }
}

/// Where the server certificate and key come from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// PKCS#12 bundle with certificate chain and key
    Pfx(LoadedFile),
    /// PEM certificate chains and keys, paired by position
    Pem {
        certificates: Vec<LoadedFile>,
        keys: Vec<LoadedFile>,
    },
}

/// Everything needed to build a TLS listener context.
///
/// Rebuilt rather than patched when a passphrase is learned, so a failed attempt
/// never leaves half-updated state behind.
#[derive(Clone)]
pub struct TlsMaterial {
    source: KeySource,
    certificate_authorities: Vec<LoadedFile>,
    revocation_lists: Vec<LoadedFile>,
    passphrase: Option<String>,
    floor: ProtocolFloor,
}

impl TlsMaterial {
    pub fn new(source: KeySource, floor: ProtocolFloor) -> Self {
        Self {
            source,
            certificate_authorities: Vec::new(),
            revocation_lists: Vec::new(),
            passphrase: None,
            floor,
        }
    }

    /// Read all TLS files named by the HTTPS config.
    ///
    /// A PFX bundle wins over certificates/keys, which are then not read at all.
    pub fn load(config: &HttpsConfig, floor: ProtocolFloor) -> Result<Self, ServerError> {
        let source = match &config.pfx {
            Some(pfx) => {
                let bundle = LoadedFile::read(pfx).inspect_err(|e| {
                    tracing::warn!(error = %e, "Error when reading PFX, server cannot continue");
                })?;
                tracing::info!(pfx = %pfx.display(), "Using PFX");
                KeySource::Pfx(bundle)
            }
            None => {
                let certificates =
                    LoadedFile::read_all(config.certificates.as_deref().unwrap_or_default())?;
                if !certificates.is_empty() {
                    tracing::info!(
                        certificates = ?config.certificates.as_deref().unwrap_or_default(),
                        "Using certificates"
                    );
                }
                let keys = LoadedFile::read_all(config.keys.as_deref().unwrap_or_default())?;
                KeySource::Pem { certificates, keys }
            }
        };

        let certificate_authorities =
            LoadedFile::read_all(config.certificate_authorities.as_deref().unwrap_or_default())?;
        let revocation_lists = LoadedFile::read_all(
            config.certificate_revocation_lists.as_deref().unwrap_or_default(),
        )?;

        let mut material = Self::new(source, floor)
            .with_certificate_authorities(certificate_authorities)
            .with_revocation_lists(revocation_lists);
        material.passphrase = config.passphrase.clone();
        Ok(material)
    }

    /// A copy of this material that decrypts keys with `passphrase`.
    pub fn with_passphrase(&self, passphrase: String) -> Self {
        Self {
            passphrase: Some(passphrase),
            ..self.clone()
        }
    }

    pub fn with_certificate_authorities(mut self, authorities: Vec<LoadedFile>) -> Self {
        self.certificate_authorities = authorities;
        self
    }

    pub fn with_revocation_lists(mut self, revocation_lists: Vec<LoadedFile>) -> Self {
        self.revocation_lists = revocation_lists;
        self
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    pub fn certificate_authorities(&self) -> &[LoadedFile] {
        &self.certificate_authorities
    }

    pub fn revocation_lists(&self) -> &[LoadedFile] {
        &self.revocation_lists
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    pub fn floor(&self) -> &ProtocolFloor {
        &self.floor
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("source", &self.source)
            .field("certificate_authorities", &self.certificate_authorities)
            .field("revocation_lists", &self.revocation_lists)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("floor", &self.floor)
            .finish()
    }
}
