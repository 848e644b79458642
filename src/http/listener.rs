//! Listener supervision.
//!
//! Each configured (protocol, address) pair gets one [`ListenerRecord`] wrapping
//! an axum-server instance. Binding happens on a spawned task; the record exists
//! immediately and learns its bound address once the socket is listening.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::GRACEFUL_SHUTDOWN_SECS;

use super::fault::FaultHandler;
use super::websocket::WebSocketSupport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Https => f.write_str("HTTPS"),
        }
    }
}

/// A started listener for one protocol and address.
#[derive(Debug)]
pub struct ListenerRecord {
    protocol: Protocol,
    address: String,
    port: u16,
    websocket: WebSocketSupport,
    handle: Handle,
    bound: watch::Receiver<Option<SocketAddr>>,
    task: Option<JoinHandle<()>>,
}

impl ListenerRecord {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The configured address, before resolution.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The configured port. Port 0 binds an ephemeral port; see [`Self::local_addr`].
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn websocket(&self) -> WebSocketSupport {
        self.websocket
    }

    /// Bound socket address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Wait until the listener is bound. Returns `None` if binding failed.
    pub async fn listening(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.clone();
        let result = bound.wait_for(Option::is_some).await;
        result.ok().and_then(|addr| *addr)
    }

    /// Stop accepting connections and drain in-flight ones.
    ///
    /// Safe to call repeatedly and on listeners that never bound.
    pub fn close(&self) {
        if let Some(addr) = self.local_addr() {
            tracing::info!(
                protocol = %self.protocol,
                address = %addr.ip(),
                port = addr.port(),
                "Closing server"
            );
        }
        self.handle
            .graceful_shutdown(Some(Duration::from_secs(GRACEFUL_SHUTDOWN_SECS)));
    }

    /// Wait for the serving task to exit.
    pub async fn wait_closed(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(
                    protocol = %self.protocol,
                    address = %self.address,
                    port = self.port,
                    error = %e,
                    "Listener task ended abnormally"
                );
            }
        }
    }
}

/// Start one listener.
///
/// The transport is built from `tls` when present. WebSocket support for the
/// protocol is attached to the app, a fault handler is installed, and binding
/// proceeds on a background task. Bind faults are reported through the fault
/// handler and never returned here.
pub fn spawn_listener(
    protocol: Protocol,
    address: &str,
    port: u16,
    app: Router,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> ListenerRecord {
    let tls = tls.map(RustlsConfig::from_config);

    let websocket = WebSocketSupport::for_protocol(protocol);
    let app = app.layer(Extension(websocket)).layer(Extension(protocol));

    let faults = FaultHandler::new(protocol, address, port);

    let handle = Handle::new();
    let (bound_tx, bound) = watch::channel(None);

    tracing::info!(
        protocol = %protocol,
        address = %address,
        port,
        "About to start listening"
    );

    let task = tokio::spawn(serve(
        protocol,
        address.to_string(),
        port,
        app,
        tls,
        handle.clone(),
        bound_tx,
        faults,
    ));

    ListenerRecord {
        protocol,
        address: address.to_string(),
        port,
        websocket,
        handle,
        bound,
        task: Some(task),
    }
}

/// Bind and serve until shutdown. `bound` is dropped on exit, which wakes any
/// caller still waiting on a listener that never bound.
#[allow(clippy::too_many_arguments)]
async fn serve(
    protocol: Protocol,
    address: String,
    port: u16,
    app: Router,
    tls: Option<RustlsConfig>,
    handle: Handle,
    bound: watch::Sender<Option<SocketAddr>>,
    faults: FaultHandler,
) {
    let addr = match resolve(&address, port).await {
        Ok(addr) => addr,
        Err(e) => {
            faults.handle(&e);
            return;
        }
    };

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let server = {
        let handle = handle.clone();
        async move {
            match tls {
                Some(config) => {
                    axum_server::bind_rustls(addr, config)
                        .handle(handle)
                        .serve(service)
                        .await
                }
                None => axum_server::bind(addr).handle(handle).serve(service).await,
            }
        }
    };
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        listening = handle.listening() => {
            if let Some(addr) = listening {
                bound.send_replace(Some(addr));
                tracing::info!(
                    protocol = %protocol,
                    address = %addr.ip(),
                    port = addr.port(),
                    "Listening"
                );
            }
            server.await
        }
    };

    if let Err(e) = result {
        faults.handle(&e);
    }
}

/// Resolve a configured address. Names that do not resolve are reported as
/// unavailable addresses.
async fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((address, port))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e))?;
    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve to any address"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CapturedLogs;
    use axum::routing::get;

    fn app() -> Router {
        Router::new().route("/", get(|| async { "ok" }))
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Http.to_string(), "HTTP");
        assert_eq!(Protocol::Https.to_string(), "HTTPS");
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve("127.0.0.1", 8543).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8543".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_failure_is_unavailable() {
        let err = resolve("not an address", 8543).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[tokio::test]
    async fn test_http_listener_binds_and_closes() {
        let mut record = spawn_listener(Protocol::Http, "127.0.0.1", 0, app(), None);
        assert_eq!(record.protocol(), Protocol::Http);
        assert_eq!(record.address(), "127.0.0.1");
        assert_eq!(record.websocket().max_payload(), None);

        let addr = record.listening().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        record.close();
        record.close();
        record.wait_closed().await;
    }

    #[tokio::test]
    async fn test_announces_before_binding() {
        let logs = CapturedLogs::default();
        let mut record =
            logs.capture(|| spawn_listener(Protocol::Http, "127.0.0.1", 0, app(), None));

        // Nothing has been polled yet, so the bind cannot have logged.
        let output = logs.contents();
        assert!(output.contains("About to start listening"));
        assert!(output.contains("protocol=HTTP"));
        assert!(output.contains("address=127.0.0.1"));
        assert!(!output.contains("Listening"));

        record.listening().await.unwrap();
        record.close();
        record.wait_closed().await;
    }

    #[tokio::test]
    async fn test_bind_fault_does_not_panic() {
        let first = spawn_listener(Protocol::Http, "127.0.0.1", 0, app(), None);
        let taken = first.listening().await.unwrap();

        let mut second = spawn_listener(Protocol::Http, "127.0.0.1", taken.port(), app(), None);
        second.wait_closed().await;
        assert_eq!(second.local_addr(), None);
        assert_eq!(second.listening().await, None);

        first.close();
    }

    #[tokio::test]
    async fn test_unresolvable_address_reports_fault() {
        let mut record = spawn_listener(Protocol::Http, "not an address", 0, app(), None);
        record.wait_closed().await;
        assert_eq!(record.local_addr(), None);
        record.close();
    }
}
