//! Configuration loading and constants.
//!
//! Loads server configuration from TOML (or JSON, for existing app server
//! configs) and defines constants for listener defaults, TLS protocol
//! option bits, WebSocket limits, logging and default paths. `ServerConfig` is the
//! root configuration struct; it is immutable once handed to the web server.

use const_format::formatcp;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// Listener Constants
// =============================================================================

/// Address used when a protocol has no (valid) configured addresses
pub const WILDCARD_ADDRESS: &str = "0.0.0.0";

/// Maximum WebSocket payload accepted on HTTPS listeners, in bytes
pub const HTTPS_WS_MAX_PAYLOAD: usize = 50_000;

/// Seconds to wait for in-flight connections when listeners are closed
pub const GRACEFUL_SHUTDOWN_SECS: u64 = 30;

// =============================================================================
// TLS Protocol Option Bits
// =============================================================================
// `secureOptions` values are OpenSSL `SSL_OP_*` bitmasks. Only the protocol
// version bits carry meaning here; other bits are accepted and ignored.

/// SSLv2 is compiled out of every modern TLS stack; the bit is zero
pub const SSL_OP_NO_SSLV2: u64 = 0;
pub const SSL_OP_NO_SSLV3: u64 = 0x0200_0000;
pub const SSL_OP_NO_TLSV1: u64 = 0x0400_0000;
pub const SSL_OP_NO_TLSV1_2: u64 = 0x0800_0000;
pub const SSL_OP_NO_TLSV1_1: u64 = 0x1000_0000;
pub const SSL_OP_NO_TLSV1_3: u64 = 0x2000_0000;

/// Default protocol floor: everything older than TLS 1.2 disabled
pub const DEFAULT_SECURE_OPTIONS: u64 =
    SSL_OP_NO_SSLV2 | SSL_OP_NO_SSLV3 | SSL_OP_NO_TLSV1 | SSL_OP_NO_TLSV1_1;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/portico.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = formatcp!("{}=info", env!("CARGO_CRATE_NAME"));

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Prompt shown when an HTTPS key or PFX bundle cannot be decrypted
pub const PASSPHRASE_PROMPT: &str =
    "HTTPS key or PFX decryption failure. Please enter passphrase: ";

/// File inside a plugin directory that describes the plugin
pub const PLUGIN_DEFINITION_FILE: &str = "pluginDefinition.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Plain HTTP listeners
    pub http: Option<HttpConfig>,
    /// TLS listeners
    pub https: Option<HttpsConfig>,
    /// Directory holding plugin locator files
    #[serde(default, alias = "pluginsDir")]
    pub plugins_dir: Option<PathBuf>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    pub port: Option<u16>,
    /// Addresses to bind. Entries are untyped so malformed ones can be skipped
    /// with a warning instead of failing the whole file.
    #[serde(default, alias = "ipAddresses")]
    pub ip_addresses: Option<Vec<serde_json::Value>>,
}

/// HTTPS listener configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpsConfig {
    pub port: Option<u16>,
    #[serde(default, alias = "ipAddresses")]
    pub ip_addresses: Option<Vec<serde_json::Value>>,
    /// PKCS#12 bundle holding certificate and key. Takes precedence over
    /// `certificates`/`keys`.
    pub pfx: Option<PathBuf>,
    /// PEM certificate chains, one file per served key
    pub certificates: Option<Vec<PathBuf>>,
    /// PEM private keys, paired by position with `certificates`
    pub keys: Option<Vec<PathBuf>>,
    /// PEM CA certificates trusted for client certificates
    #[serde(default, alias = "certificateAuthorities")]
    pub certificate_authorities: Option<Vec<PathBuf>>,
    /// PEM CRLs applied to client certificates
    #[serde(default, alias = "certificateRevocationLists")]
    pub certificate_revocation_lists: Option<Vec<PathBuf>>,
    /// OpenSSL `SSL_OP_*` bitmask
    #[serde(default, alias = "secureOptions")]
    pub secure_options: Option<u64>,
    /// OpenSSL method name, e.g. `TLSv1_2_method`
    #[serde(default, alias = "secureProtocol")]
    pub secure_protocol: Option<String>,
    /// Passphrase for an encrypted key or PFX bundle. Without it the server
    /// prompts on the terminal.
    pub passphrase: Option<String>,
}

impl HttpsConfig {
    /// Check that some certificate source is configured (PFX or cert+key)
    pub fn has_credentials(&self) -> bool {
        self.pfx.is_some() || (self.certificates.is_some() && self.keys.is_some())
    }

    /// HTTPS listeners are only started with both a port and credentials.
    pub fn is_enabled(&self) -> bool {
        self.port.is_some() && self.has_credentials()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl ServerConfig {
    /// Load configuration from a file. `.json` files are parsed as JSON,
    /// anything else as TOML. A relative `plugins_dir` is resolved against
    /// the directory of the config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config: ServerConfig = if is_json {
            serde_json::from_str(&contents)?
        } else {
            toml::from_str(&contents)?
        };

        if let Some(plugins_dir) = config.plugins_dir.as_mut() {
            if plugins_dir.is_relative() {
                if let Some(base) = path.parent() {
                    *plugins_dir = base.join(&*plugins_dir);
                }
            }
        }

        Ok(config)
    }

    /// Whether the configuration can run at all: an HTTP port, or an HTTPS port
    /// together with a certificate source.
    pub fn is_valid(&self) -> bool {
        if self.http_port().is_some() {
            return true;
        }
        match &self.https {
            Some(https) => https.is_enabled(),
            None => false,
        }
    }

    /// HTTP port when HTTP is enabled
    pub fn http_port(&self) -> Option<u16> {
        self.http.as_ref().and_then(|http| http.port)
    }

    /// HTTPS port when HTTPS is enabled
    pub fn https_port(&self) -> Option<u16> {
        self.https
            .as_ref()
            .filter(|https| https.is_enabled())
            .and_then(|https| https.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
}
