//! End-to-end tests binding real listeners on ephemeral ports.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use portico::config::{HttpConfig, HttpsConfig, ServerConfig};
use portico::http::{Protocol, WebServer};
use portico::routes::create_router;
use portico::tls::{PassphrasePrompt, PassphraseReader};
use portico::ServerError;

/// Answers passphrase prompts from a script and counts how often it was opened.
#[derive(Clone, Default)]
struct ScriptedPrompt {
    answers: Arc<Mutex<VecDeque<String>>>,
    opened: Arc<AtomicUsize>,
}

impl ScriptedPrompt {
    fn answering(answers: &[&str]) -> Self {
        Self {
            answers: Arc::new(Mutex::new(
                answers.iter().map(|answer| answer.to_string()).collect(),
            )),
            ..Default::default()
        }
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PassphrasePrompt for ScriptedPrompt {
    async fn open(&self) -> io::Result<Box<dyn PassphraseReader>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedReader(Arc::clone(&self.answers))))
    }
}

struct ScriptedReader(Arc<Mutex<VecDeque<String>>>);

#[async_trait]
impl PassphraseReader for ScriptedReader {
    async fn read_passphrase(&mut self, _message: &str) -> io::Result<String> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more answers"))
    }
}

struct Credentials {
    _dir: TempDir,
    cert: PathBuf,
    key: PathBuf,
}

fn write_credentials(passphrase: Option<&str>) -> Credentials {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let key_pem = match passphrase {
        Some(passphrase) => encrypt_key(&key_pair.serialize_pem(), passphrase),
        None => key_pair.serialize_pem(),
    };

    let dir = TempDir::new().unwrap();
    let cert_path = dir.path().join("server.cert");
    let key_path = dir.path().join("server.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pem).unwrap();

    Credentials {
        _dir: dir,
        cert: cert_path,
        key: key_path,
    }
}

fn encrypt_key(key_pem: &str, passphrase: &str) -> String {
    let plain = pem::parse(key_pem).unwrap();
    let info = pkcs8::PrivateKeyInfo::try_from(plain.contents()).unwrap();
    let params =
        pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(1000, &[3u8; 16], &[5u8; 16])
            .unwrap();
    let encrypted = info.encrypt_with_params(params, passphrase).unwrap();
    pem::encode(&pem::Pem::new(
        "ENCRYPTED PRIVATE KEY",
        encrypted.as_bytes().to_vec(),
    ))
}

fn https_config(credentials: &Credentials, addresses: serde_json::Value) -> HttpsConfig {
    HttpsConfig {
        port: Some(0),
        ip_addresses: addresses.as_array().cloned(),
        certificates: Some(vec![credentials.cert.clone()]),
        keys: Some(vec![credentials.key.clone()]),
        ..Default::default()
    }
}

fn http_config(addresses: serde_json::Value) -> HttpConfig {
    HttpConfig {
        port: Some(0),
        ip_addresses: addresses.as_array().cloned(),
    }
}

fn https_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

/// Open `wss://localhost/ws` on `addr`, trusting only the test certificate.
async fn connect_wss(
    credentials: &Credentials,
    addr: std::net::SocketAddr,
) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let cert = pem::parse(std::fs::read(&credentials.cert).unwrap()).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(cert.into_contents()))
        .unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let stream = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = tokio_tungstenite::client_async_tls_with_config(
        format!("wss://localhost:{}/ws", addr.port()),
        stream,
        None,
        Some(Connector::Rustls(Arc::new(client))),
    )
    .await
    .unwrap();
    socket
}

async fn start(server: &mut WebServer, config: ServerConfig) {
    server.set_config(config).unwrap();
    server.start_listening(create_router()).await.unwrap();
}

#[tokio::test]
async fn test_http_health_check() {
    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            http: Some(http_config(json!(["127.0.0.1"]))),
            ..Default::default()
        },
    )
    .await;

    let addr = server.http_listeners()[0].listening().await.unwrap();
    let body = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_https_without_addresses_binds_wildcard() {
    let credentials = write_credentials(None);
    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            https: Some(https_config(&credentials, json!(null))),
            ..Default::default()
        },
    )
    .await;

    assert!(server.http_listeners().is_empty());
    assert_eq!(server.https_listeners().len(), 1);
    let record = &server.https_listeners()[0];
    assert_eq!(record.protocol(), Protocol::Https);
    assert_eq!(record.address(), "0.0.0.0");
    assert_eq!(record.websocket().max_payload(), Some(50_000));

    let addr = record.listening().await.unwrap();
    assert!(addr.ip().is_unspecified());

    let body = https_client()
        .get(format!("https://127.0.0.1:{}/health", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_both_protocols_start() {
    let credentials = write_credentials(None);
    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            http: Some(http_config(json!(["127.0.0.1"]))),
            https: Some(https_config(&credentials, json!(["127.0.0.1"]))),
            ..Default::default()
        },
    )
    .await;

    assert_eq!(server.http_listeners().len(), 1);
    assert_eq!(server.https_listeners().len(), 1);
    assert!(server.http_listeners()[0].listening().await.is_some());
    assert!(server.https_listeners()[0].listening().await.is_some());

    server.close();
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_malformed_certificate_fails_startup() {
    let credentials = write_credentials(None);
    std::fs::write(&credentials.cert, "not a certificate").unwrap();

    let prompt = ScriptedPrompt::default();
    let mut server = WebServer::with_prompt(prompt.clone());
    server
        .set_config(ServerConfig {
            https: Some(https_config(&credentials, json!(["127.0.0.1"]))),
            ..Default::default()
        })
        .unwrap();

    let err = server.start_listening(create_router()).await.unwrap_err();
    assert!(matches!(err, ServerError::ListenerConstruction(_)));
    assert!(server.https_listeners().is_empty());
    assert_eq!(prompt.opened(), 0);
}

#[tokio::test]
async fn test_encrypted_key_with_configured_passphrase() {
    let credentials = write_credentials(Some("correct horse"));
    let prompt = ScriptedPrompt::default();
    let mut server = WebServer::with_prompt(prompt.clone());
    let mut https = https_config(&credentials, json!(["127.0.0.1"]));
    https.passphrase = Some("correct horse".to_string());
    start(
        &mut server,
        ServerConfig {
            https: Some(https),
            ..Default::default()
        },
    )
    .await;

    assert_eq!(prompt.opened(), 0);
    assert!(server.https_listeners()[0].listening().await.is_some());

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_prompted_passphrase_is_reused_across_addresses() {
    let credentials = write_credentials(Some("correct horse"));
    let prompt = ScriptedPrompt::answering(&["wrong", "correct horse"]);
    let mut server = WebServer::with_prompt(prompt.clone());
    let mut https = https_config(&credentials, json!(["127.0.0.1", "localhost"]));
    https.passphrase = Some("stale".to_string());
    start(
        &mut server,
        ServerConfig {
            https: Some(https),
            ..Default::default()
        },
    )
    .await;

    assert_eq!(prompt.opened(), 2);
    assert_eq!(server.https_listeners().len(), 2);
    assert!(server.https_listeners()[0].listening().await.is_some());

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_pfx_bundle() {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let pfx = p12::PFX::new(
        cert.der().as_ref(),
        &key_pair.serialize_der(),
        None,
        "bundle-pass",
        "server",
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let pfx_path = dir.path().join("server.pfx");
    std::fs::write(&pfx_path, pfx.to_der()).unwrap();

    let prompt = ScriptedPrompt::answering(&["bundle-pass"]);
    let mut server = WebServer::with_prompt(prompt.clone());
    start(
        &mut server,
        ServerConfig {
            https: Some(HttpsConfig {
                port: Some(0),
                ip_addresses: Some(vec![json!("127.0.0.1")]),
                pfx: Some(pfx_path),
                // Ignored when a PFX is configured
                certificates: Some(vec![PathBuf::from("/nonexistent/server.cert")]),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
    .await;

    assert_eq!(prompt.opened(), 1);
    let addr = server.https_listeners()[0].listening().await.unwrap();
    let status = https_client()
        .get(format!("https://{addr}/health"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_pfx_with_sha256_mac_fails_without_prompting() {
    let prompt = ScriptedPrompt::answering(&["hunter2"]);
    let mut server = WebServer::with_prompt(prompt.clone());
    server
        .set_config(ServerConfig {
            https: Some(HttpsConfig {
                port: Some(0),
                ip_addresses: Some(vec![json!("127.0.0.1")]),
                pfx: Some(PathBuf::from(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/tests/data/openssl3-sha256.pfx"
                ))),
                passphrase: Some("hunter2".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();

    let err = server.start_listening(create_router()).await.unwrap_err();
    assert!(matches!(err, ServerError::ListenerConstruction(_)), "{err}");
    assert_eq!(prompt.opened(), 0);
    assert!(server.https_listeners().is_empty());
}

#[tokio::test]
async fn test_websocket_echo() {
    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            http: Some(http_config(json!(["127.0.0.1"]))),
            ..Default::default()
        },
    )
    .await;

    let addr = server.http_listeners()[0].listening().await.unwrap();
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    socket.send(Message::text("hello")).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::text("hello"));

    socket.close(None).await.unwrap();
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_oversized_websocket_message_echoed_over_http() {
    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            http: Some(http_config(json!(["127.0.0.1"]))),
            ..Default::default()
        },
    )
    .await;

    let addr = server.http_listeners()[0].listening().await.unwrap();
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    let payload = "x".repeat(60_000);
    socket.send(Message::text(payload.clone())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::text(payload));

    socket.close(None).await.unwrap();
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_https_websocket_messages_are_capped() {
    let credentials = write_credentials(None);
    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            https: Some(https_config(&credentials, json!(["127.0.0.1"]))),
            ..Default::default()
        },
    )
    .await;
    let addr = server.https_listeners()[0].listening().await.unwrap();

    // Under the cap the listener echoes as usual.
    let mut socket = connect_wss(&credentials, addr).await;
    let payload = "x".repeat(40_000);
    socket.send(Message::text(payload.clone())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::text(payload));
    socket.close(None).await.unwrap();

    // Over the cap the server drops the connection instead of echoing.
    let mut socket = connect_wss(&credentials, addr).await;
    let payload = "x".repeat(60_000);
    let reply = tokio::time::timeout(Duration::from_secs(10), async {
        match socket.send(Message::text(payload.clone())).await {
            Ok(()) => socket.next().await,
            Err(e) => Some(Err(e)),
        }
    })
    .await
    .expect("connection was neither answered nor closed");
    match reply {
        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
        Some(Ok(message)) => panic!("oversized message was answered: {} bytes", message.len()),
    }

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_port_in_use_is_logged_not_returned() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(
        &mut server,
        ServerConfig {
            http: Some(HttpConfig {
                port: Some(port),
                ip_addresses: Some(vec![json!("127.0.0.1")]),
            }),
            ..Default::default()
        },
    )
    .await;

    assert_eq!(server.http_listeners().len(), 1);
    assert_eq!(server.http_listeners()[0].listening().await, None);

    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let credentials = write_credentials(None);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("server.json");
    std::fs::write(
        &path,
        json!({
            "http": { "port": 0, "ipAddresses": ["127.0.0.1"] },
            "https": {
                "port": 0,
                "ipAddresses": ["127.0.0.1", 1234],
                "certificates": [credentials.cert],
                "keys": [credentials.key]
            },
            "pluginsDir": "plugins"
        })
        .to_string(),
    )
    .unwrap();

    let config = ServerConfig::load(&path).unwrap();
    assert!(WebServer::is_config_valid(&config));
    assert_eq!(config.plugins_dir.as_deref(), Some(dir.path().join("plugins").as_path()));

    let mut server = WebServer::with_prompt(ScriptedPrompt::default());
    start(&mut server, config).await;
    assert_eq!(server.https_listeners().len(), 1);
    assert_eq!(server.http_listeners().len(), 1);

    server.close();
    server.wait_closed().await;
}
