//! Builds the rustls server configuration for an HTTPS listener.
//!
//! Handles PEM certificate chains, plain and encrypted private keys, PKCS#12
//! bundles, client CA trust with CRLs, and the protocol floor. Decryption
//! failures are reported as their own error kind so the caller can ask for a
//! passphrase and retry.

use std::sync::Arc;

use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::server::danger::ClientCertVerifier;
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs1KeyDer,
    PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};

use super::material::{KeySource, LoadedFile, TlsMaterial};

/// Failure to turn TLS material into a listener context.
#[derive(Debug, thiserror::Error)]
pub enum TlsContextError {
    #[error("Key or PFX decryption failure: {0}")]
    Decryption(String),

    #[error("Invalid PEM data: {0}")]
    Pem(#[from] pem::PemError),

    #[error("Invalid PFX bundle: {0}")]
    Pfx(String),

    #[error("Unsupported PFX MAC algorithm in {0}, re-export it with legacy PKCS#12 algorithms")]
    UnsupportedPfxMac(String),

    #[error("No certificate found in {0}")]
    NoCertificate(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("{certificates} certificate chain(s) configured for {keys} key(s)")]
    KeyCountMismatch { certificates: usize, keys: usize },

    #[error("Unsupported key encryption in {0}")]
    UnsupportedKeyEncryption(String),

    #[error("Unsupported secure protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Secure options {0:#x} disable every supported TLS version")]
    NoProtocolVersions(u64),

    #[error("Client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsContextError {
    /// Whether a passphrase (or a different one) could fix this error.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }
}

/// Build a server config from loaded material.
pub fn build_server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>, TlsContextError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let keys = certified_keys(material, &provider)?;
    let versions = material.floor().protocol_versions()?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)?;
    let builder = match client_verifier(material, &provider)? {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_cert_resolver(Arc::new(KeyTypeResolver { keys }));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn certified_keys(
    material: &TlsMaterial,
    provider: &CryptoProvider,
) -> Result<Vec<Arc<CertifiedKey>>, TlsContextError> {
    let passphrase = material.passphrase();
    let pairs = match material.source() {
        KeySource::Pfx(bundle) => vec![load_pfx(bundle, passphrase)?],
        KeySource::Pem { certificates, keys } => {
            if certificates.len() != keys.len() {
                return Err(TlsContextError::KeyCountMismatch {
                    certificates: certificates.len(),
                    keys: keys.len(),
                });
            }
            if certificates.is_empty() {
                return Err(TlsContextError::NoCertificate("configuration".to_string()));
            }
            certificates
                .iter()
                .zip(keys)
                .map(|(chain, key)| {
                    Ok((parse_certificates(chain)?, parse_private_key(key, passphrase)?))
                })
                .collect::<Result<Vec<_>, TlsContextError>>()?
        }
    };

    pairs
        .into_iter()
        .map(|(chain, key)| {
            let signing_key = provider.key_provider.load_private_key(key)?;
            Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
        })
        .collect()
}

fn parse_certificates(file: &LoadedFile) -> Result<Vec<CertificateDer<'static>>, TlsContextError> {
    let chain: Vec<_> = pem::parse_many(&file.contents)?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();

    if chain.is_empty() {
        return Err(TlsContextError::NoCertificate(file.path.display().to_string()));
    }
    Ok(chain)
}

fn parse_private_key(
    file: &LoadedFile,
    passphrase: Option<&str>,
) -> Result<PrivateKeyDer<'static>, TlsContextError> {
    let origin = || file.path.display().to_string();

    for block in pem::parse_many(&file.contents)? {
        match block.tag() {
            "PRIVATE KEY" => {
                return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())));
            }
            "ENCRYPTED PRIVATE KEY" => {
                return decrypt_pkcs8(block.contents(), passphrase, &origin())
                    .map(PrivateKeyDer::Pkcs8);
            }
            "RSA PRIVATE KEY" | "EC PRIVATE KEY" => {
                // OpenSSL "traditional" encryption (Proc-Type/DEK-Info headers)
                let encrypted = block
                    .headers()
                    .get("Proc-Type")
                    .is_some_and(|value| value.contains("ENCRYPTED"));
                if encrypted {
                    return Err(TlsContextError::UnsupportedKeyEncryption(origin()));
                }
                let is_rsa = block.tag() == "RSA PRIVATE KEY";
                let contents = block.into_contents();
                return Ok(if is_rsa {
                    PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(contents))
                } else {
                    PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(contents))
                });
            }
            _ => continue,
        }
    }

    Err(TlsContextError::NoPrivateKey(origin()))
}

fn decrypt_pkcs8(
    der: &[u8],
    passphrase: Option<&str>,
    origin: &str,
) -> Result<PrivatePkcs8KeyDer<'static>, TlsContextError> {
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der)
        .map_err(|_| TlsContextError::UnsupportedKeyEncryption(origin.to_string()))?;

    let Some(passphrase) = passphrase else {
        return Err(TlsContextError::Decryption(format!(
            "{origin} is encrypted and no passphrase was given"
        )));
    };

    let document = match encrypted.decrypt(passphrase) {
        Ok(document) => document,
        Err(pkcs8::Error::EncryptedPrivateKey(pkcs8::pkcs5::Error::DecryptFailed))
        | Err(pkcs8::Error::Asn1(_)) => {
            return Err(TlsContextError::Decryption(format!("bad passphrase for {origin}")));
        }
        Err(_) => return Err(TlsContextError::UnsupportedKeyEncryption(origin.to_string())),
    };

    // A wrong passphrase can still yield valid padding; the plaintext must parse.
    if pkcs8::PrivateKeyInfo::try_from(document.as_bytes()).is_err() {
        return Err(TlsContextError::Decryption(format!("bad passphrase for {origin}")));
    }

    Ok(PrivatePkcs8KeyDer::from(document.as_bytes().to_vec()))
}

fn load_pfx(
    bundle: &LoadedFile,
    passphrase: Option<&str>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsContextError> {
    let origin = bundle.path.display().to_string();
    let pfx = p12::PFX::parse(&bundle.contents)
        .map_err(|e| TlsContextError::Pfx(format!("{origin}: {e:?}")))?;

    // verify_mac only understands SHA-1; any other MAC is fatal, not a bad passphrase.
    if let Some(mac_data) = &pfx.mac_data {
        if mac_data.mac.digest_algorithm != p12::AlgorithmIdentifier::Sha1 {
            return Err(TlsContextError::UnsupportedPfxMac(origin));
        }
    }

    let password = passphrase.unwrap_or_default();
    if !pfx.verify_mac(password) {
        return Err(TlsContextError::Decryption(format!("mac verify failure for {origin}")));
    }

    let key = pfx
        .key_bags(password)
        .map_err(|e| TlsContextError::Pfx(format!("{origin}: {e:?}")))?
        .into_iter()
        .next()
        .ok_or_else(|| TlsContextError::NoPrivateKey(origin.clone()))?;
    let chain: Vec<_> = pfx
        .cert_x509_bags(password)
        .map_err(|e| TlsContextError::Pfx(format!("{origin}: {e:?}")))?
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    if chain.is_empty() {
        return Err(TlsContextError::NoCertificate(origin));
    }

    Ok((chain, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key))))
}

/// Client certificates are verified against configured CAs and CRLs when
/// presented, but anonymous clients are still accepted.
fn client_verifier(
    material: &TlsMaterial,
    provider: &Arc<CryptoProvider>,
) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsContextError> {
    if material.certificate_authorities().is_empty() {
        if !material.revocation_lists().is_empty() {
            tracing::warn!(
                "Certificate revocation lists configured without certificate authorities, ignoring"
            );
        }
        return Ok(None);
    }

    let mut roots = RootCertStore::empty();
    for authority in material.certificate_authorities() {
        for certificate in parse_certificates(authority)? {
            roots.add(certificate)?;
        }
    }

    let mut crls = Vec::new();
    for list in material.revocation_lists() {
        crls.extend(parse_revocation_lists(list)?);
    }

    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
            .with_crls(crls)
            .allow_unauthenticated()
            .build()?;
    Ok(Some(verifier))
}

/// CRLs are accepted as PEM (`X509 CRL` blocks) or raw DER.
fn parse_revocation_lists(
    file: &LoadedFile,
) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsContextError> {
    let blocks = pem::parse_many(&file.contents)?;
    if blocks.is_empty() {
        return Ok(vec![CertificateRevocationListDer::from(file.contents.clone())]);
    }
    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == "X509 CRL")
        .map(|block| CertificateRevocationListDer::from(block.into_contents()))
        .collect())
}

/// Serves the first configured key whose type the client can verify,
/// e.g. an ECDSA and an RSA certificate side by side.
#[derive(Debug)]
struct KeyTypeResolver {
    keys: Vec<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for KeyTypeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let offered = client_hello.signature_schemes();
        self.keys
            .iter()
            .find(|certified| certified.key.choose_scheme(offered).is_some())
            .or_else(|| self.keys.first())
            .cloned()
    }
}
