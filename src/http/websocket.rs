//! WebSocket upgrade support attached to every listener.
//!
//! The supervisor inserts a [`WebSocketSupport`] extension per listener; handlers
//! take [`WsUpgrade`] instead of axum's `WebSocketUpgrade` to get the limits of
//! the listener the request arrived on.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::FromRequestParts;
use http::request::Parts;

use crate::config::HTTPS_WS_MAX_PAYLOAD;

use super::listener::Protocol;

/// WebSocket limits for one listener. `None` keeps the library defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebSocketSupport {
    max_payload: Option<usize>,
}

impl WebSocketSupport {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Https => Self {
                max_payload: Some(HTTPS_WS_MAX_PAYLOAD),
            },
            Protocol::Http => Self::default(),
        }
    }

    pub fn max_payload(&self) -> Option<usize> {
        self.max_payload
    }

    /// Apply these limits to a pending upgrade.
    pub fn apply(&self, upgrade: WebSocketUpgrade) -> WebSocketUpgrade {
        match self.max_payload {
            Some(limit) => upgrade.max_message_size(limit).max_frame_size(limit),
            None => upgrade,
        }
    }
}

/// A WebSocket upgrade with the receiving listener's limits applied.
pub struct WsUpgrade(pub WebSocketUpgrade);

impl<S> FromRequestParts<S> for WsUpgrade
where
    S: Send + Sync,
{
    type Rejection = WebSocketUpgradeRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let upgrade = WebSocketUpgrade::from_request_parts(parts, state).await?;
        let support = parts
            .extensions
            .get::<WebSocketSupport>()
            .copied()
            .unwrap_or_default();
        Ok(Self(support.apply(upgrade)))
    }
}
