//! Web server lifecycle: validate configuration, start listeners, close them.

use std::sync::Arc;

use axum::Router;

use crate::config::{HttpConfig, HttpsConfig, ServerConfig};
use crate::error::{Result, ServerError};
use crate::tls::{
    build_server_config, construct_with_recovery, PassphrasePrompt, ProtocolFloor,
    TerminalPrompt, TlsMaterial,
};

use super::address::AddressSet;
use super::listener::{spawn_listener, ListenerRecord, Protocol};

/// Owns the configuration and every listener started from it.
pub struct WebServer {
    config: Option<Arc<ServerConfig>>,
    https_floor: Option<ProtocolFloor>,
    prompt: Box<dyn PassphrasePrompt>,
    http_listeners: Vec<ListenerRecord>,
    https_listeners: Vec<ListenerRecord>,
}

impl Default for WebServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebServer {
    /// A server that asks for key passphrases on the terminal.
    pub fn new() -> Self {
        Self::with_prompt(TerminalPrompt)
    }

    pub fn with_prompt(prompt: impl PassphrasePrompt + 'static) -> Self {
        Self {
            config: None,
            https_floor: None,
            prompt: Box::new(prompt),
            http_listeners: Vec::new(),
            https_listeners: Vec::new(),
        }
    }

    /// Whether `config` enables at least one usable protocol.
    pub fn is_config_valid(config: &ServerConfig) -> bool {
        config.is_valid()
    }

    /// Store the configuration for the next [`Self::start_listening`].
    ///
    /// When HTTPS is enabled the protocol floor is fixed here; it is applied
    /// when listeners are built.
    pub fn set_config(&mut self, config: ServerConfig) -> Result<()> {
        if !Self::is_config_valid(&config) {
            return Err(ServerError::InvalidConfiguration(
                "enable http with a port, or https with a port and a pfx or certificates and keys"
                    .to_string(),
            ));
        }

        if let Some(https) = config.https.as_ref() {
            if https.port.is_some() && !https.has_credentials() {
                tracing::warn!(
                    "HTTPS port configured without a pfx or certificates and keys, skipping HTTPS"
                );
            }
        }
        self.https_floor = config
            .https
            .as_ref()
            .filter(|https| https.is_enabled())
            .map(ProtocolFloor::resolve);
        if let Some(floor) = &self.https_floor {
            tracing::debug!(?floor, "HTTPS protocol floor");
        }

        self.config = Some(Arc::new(config));
        Ok(())
    }

    pub fn config(&self) -> Option<&ServerConfig> {
        self.config.as_deref()
    }

    /// Start every configured listener, serving `app` on each.
    ///
    /// HTTPS listeners come first, one address at a time, because building one
    /// may stop to ask for a passphrase. HTTP listeners follow. Returns once all
    /// listeners have been started; binding itself completes in the background
    /// and bind faults are only logged.
    pub async fn start_listening(&mut self, app: Router) -> Result<()> {
        let config = self.config.clone().ok_or(ServerError::NotConfigured)?;

        if let (Some(https), Some(port), Some(floor)) = (
            config.https.as_ref(),
            config.https_port(),
            self.https_floor.clone(),
        ) {
            self.start_https(https, port, floor, &app).await?;
        }

        if let (Some(http), Some(port)) = (config.http.as_ref(), config.http_port()) {
            self.start_http(http, port, &app);
        }

        Ok(())
    }

    async fn start_https(
        &mut self,
        https: &HttpsConfig,
        port: u16,
        floor: ProtocolFloor,
        app: &Router,
    ) -> Result<()> {
        let addresses = AddressSet::from_config(https.ip_addresses.as_deref());
        let mut material = TlsMaterial::load(https, floor)?;

        for address in addresses.bind_targets() {
            let recovered =
                construct_with_recovery(material, self.prompt.as_ref(), build_server_config)
                    .await?;
            if recovered.attempts > 1 {
                tracing::info!(
                    address = %address,
                    attempts = recovered.attempts,
                    "HTTPS key decrypted"
                );
            }
            // A recovered passphrase carries over to the remaining addresses.
            material = recovered.material;

            let record = spawn_listener(
                Protocol::Https,
                address,
                port,
                app.clone(),
                Some(recovered.value),
            );
            self.https_listeners.push(record);
        }
        Ok(())
    }

    fn start_http(&mut self, http: &HttpConfig, port: u16, app: &Router) {
        let addresses = AddressSet::from_config(http.ip_addresses.as_deref());
        for address in addresses.bind_targets() {
            let record = spawn_listener(Protocol::Http, address, port, app.clone(), None);
            self.http_listeners.push(record);
        }
    }

    pub fn http_listeners(&self) -> &[ListenerRecord] {
        &self.http_listeners
    }

    pub fn https_listeners(&self) -> &[ListenerRecord] {
        &self.https_listeners
    }

    /// Ask every listener to stop, HTTP first. Best effort and idempotent.
    pub fn close(&self) {
        for record in self.http_listeners.iter().chain(self.https_listeners.iter()) {
            record.close();
        }
    }

    /// Wait for every listener task to finish after [`Self::close`].
    pub async fn wait_closed(&mut self) {
        for record in self
            .http_listeners
            .iter_mut()
            .chain(self.https_listeners.iter_mut())
        {
            record.wait_closed().await;
        }
    }
}
