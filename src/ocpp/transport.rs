//! WebSocket transport to the CSMS
//!
//! The client manager consumes the [`WsTransport`] contract; the shipped
//! implementation rides on tokio-tungstenite with rustls. Reconnection uses
//! exponential backoff doubling from the initial interval up to the cap,
//! counting attempts (0 = retry forever) and resetting on success.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};

/// OCPP 2.0.1 WebSocket subprotocol.
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: String,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub verify_peer: bool,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            verify_peer: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_interval: Duration::from_secs(300),
            max_reconnect_attempts: 0,
        }
    }
}

/// Callbacks surfaced to the owner of the transport.
#[derive(Clone)]
pub struct TransportEvents {
    pub on_open: Arc<dyn Fn(bool) + Send + Sync>,
    pub on_message: Arc<dyn Fn(String) + Send + Sync>,
    pub on_close: Arc<dyn Fn(String) + Send + Sync>,
    pub on_error: Arc<dyn Fn(String, i32) + Send + Sync>,
}

/// Transport contract the client manager consumes.
#[async_trait]
pub trait WsTransport: Send + Sync {
    /// Begin connecting; events fire from the transport's own task.
    fn start(&self, events: TransportEvents) -> Result<()>;

    /// True when the frame was sent or buffered for send; false when the
    /// connection is Closed or there is no live link to buffer on.
    fn send(&self, text: &str) -> bool;

    async fn close(&self, reason: &str);

    fn state(&self) -> ConnectionState;
}

/// tokio-tungstenite implementation with rustls.
pub struct TungsteniteTransport {
    config: WebSocketConfig,
    state: Arc<Mutex<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TungsteniteTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            outbound: Arc::new(Mutex::new(None)),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn build_connector(config: &WebSocketConfig) -> Result<Option<Connector>> {
        if !config.url.starts_with("wss://") {
            return Ok(None);
        }

        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_path) = &config.ca_cert_path {
            for cert in load_certs(ca_path)? {
                roots.add(cert).map_err(|e| {
                    GatewayError::Security(format!("failed to add CA certificate: {e}"))
                })?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let builder = rustls::ClientConfig::builder();
        let builder = if config.verify_peer {
            builder.with_root_certificates(roots)
        } else {
            warn!("peer verification disabled, accepting any server certificate");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
        };

        let tls = match (&config.client_cert_path, &config.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| GatewayError::Security(format!("client certificate: {e}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(GatewayError::ConfigValidation(
                    "client certificate and key must both be set".into(),
                ))
            }
        };

        Ok(Some(Connector::Rustls(Arc::new(tls))))
    }

    async fn run(
        config: WebSocketConfig,
        state: Arc<Mutex<ConnectionState>>,
        outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
        events: TransportEvents,
        cancel: CancellationToken,
    ) {
        let mut attempts: u32 = 0;
        let mut interval = config.reconnect_interval;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            *state.lock() = if attempts == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };

            match Self::connect_once(&config).await {
                Ok(stream) => {
                    info!(url = %config.url, "connected to CSMS");
                    *state.lock() = ConnectionState::Connected;
                    attempts = 0;
                    interval = config.reconnect_interval;
                    (events.on_open)(true);

                    let reason = Self::serve(stream, &outbound, &events, &cancel).await;
                    outbound.lock().take();
                    (events.on_close)(reason);
                }
                Err(e) => {
                    error!(url = %config.url, error = %e, "connection attempt failed");
                    (events.on_open)(false);
                    let code = match &e {
                        GatewayError::Network { code, .. } => code.unwrap_or(0),
                        _ => 0,
                    };
                    (events.on_error)(e.to_string(), code);
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            attempts += 1;
            if config.max_reconnect_attempts != 0 && attempts >= config.max_reconnect_attempts {
                warn!(attempts, "reconnect attempts exhausted");
                break;
            }

            *state.lock() = ConnectionState::Reconnecting;
            debug!(attempt = attempts, delay_secs = interval.as_secs(), "scheduling reconnect");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            interval = next_backoff(interval, config.max_reconnect_interval);
        }

        *state.lock() = ConnectionState::Closed;
    }

    async fn connect_once(
        config: &WebSocketConfig,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::ConfigValidation(format!("invalid CSMS URL: {e}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let connector = Self::build_connector(config)?;

        let connect = connect_async_tls_with_config(request, None, false, connector);
        let (stream, response) = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| GatewayError::Timeout("CSMS connect timeout".into()))?
            .map_err(|e| GatewayError::network(format!("WebSocket connect failed: {e}")))?;

        match response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
        {
            Some(p) if p == OCPP_SUBPROTOCOL => {}
            other => warn!(negotiated = ?other, "CSMS did not confirm the ocpp2.0.1 subprotocol"),
        }

        Ok(stream)
    }

    /// Pump frames until the link drops; returns the close reason.
    async fn serve(
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        outbound: &Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
        events: &TransportEvents,
        cancel: &CancellationToken,
    ) -> String {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *outbound.lock() = Some(tx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return "client shutdown".into();
                }
                text = rx.recv() => {
                    match text {
                        Some(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                (events.on_error)(format!("send failed: {e}"), 0);
                                return format!("send failed: {e}");
                            }
                        }
                        None => return "outbound channel closed".into(),
                    }
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => (events.on_message)(text),
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = sink.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            return frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed by peer".into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            (events.on_error)(format!("receive failed: {e}"), 0);
                            return format!("receive failed: {e}");
                        }
                        None => return "stream ended".into(),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WsTransport for TungsteniteTransport {
    fn start(&self, events: TransportEvents) -> Result<()> {
        let mut cancel_slot = self.cancel.lock();
        if cancel_slot.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        let task = tokio::spawn(Self::run(
            self.config.clone(),
            self.state.clone(),
            self.outbound.clone(),
            events,
            cancel,
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    fn send(&self, text: &str) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    async fn close(&self, reason: &str) {
        info!(reason, "closing CSMS connection");
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *self.state.lock() = ConnectionState::Closed;
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

/// Doubling backoff capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| {
        GatewayError::Security(format!("cannot open certificate {}: {e}", path.display()))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Security(format!("invalid certificate PEM: {e}")))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| {
        GatewayError::Security(format!("cannot open key {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| GatewayError::Security(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| GatewayError::Security("no private key found in PEM".into()))
}

/// Accepts any server certificate. Installed only when `verify_peer` is off.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(300);
        let mut interval = Duration::from_secs(5);
        let mut seen = Vec::new();
        for _ in 0..8 {
            interval = next_backoff(interval, max);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![10, 20, 40, 80, 160, 300, 300, 300]);
    }

    #[test]
    fn send_on_fresh_transport_fails() {
        let transport = TungsteniteTransport::new(WebSocketConfig::default());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.send("[2,\"x\",\"Heartbeat\",{}]"));
    }
}
