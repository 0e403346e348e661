//! WebSocket channel to a TrueNAS appliance
//!
//! `wss://` endpoints go through rustls. With `allow_insecure` set the
//! certificate chain is not verified (appliances usually ship self-signed
//! certificates); handshake signatures are still checked.

use super::endpoint::Endpoint;
use super::RpcError;
use crate::domain::ports::{Connector, WireChannel};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production [`Connector`] over tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        allow_insecure: bool,
    ) -> Result<Box<dyn WireChannel>, RpcError> {
        let connector = if endpoint.scheme().is_tls() {
            tokio_tungstenite::Connector::Rustls(Arc::new(tls_config(allow_insecure)?))
        } else {
            tokio_tungstenite::Connector::Plain
        };

        let (stream, response) = tokio_tungstenite::connect_async_tls_with_config(
            endpoint.url(),
            None,
            true,
            Some(connector),
        )
        .await
        .map_err(|e| RpcError::Channel(e.to_string()))?;

        debug!(
            endpoint = %endpoint,
            status = %response.status(),
            "WebSocket connection established"
        );
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

/// Text-frame channel over an open WebSocket
pub struct WebSocketChannel {
    stream: WsStream,
}

#[async_trait]
impl WireChannel for WebSocketChannel {
    async fn send_text(&mut self, frame: String) -> Result<(), RpcError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| RpcError::Channel(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<String, RpcError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| RpcError::Protocol(format!("non utf-8 frame: {}", e)))
                }
                Some(Ok(Message::Close(_))) | None => return Err(RpcError::Closed),
                // ping, pong and raw frames
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RpcError::Channel(e.to_string())),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), RpcError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| RpcError::Channel(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close: {}", e);
        }
    }
}

// =============================================================================
// TLS
// =============================================================================

fn tls_config(allow_insecure: bool) -> Result<ClientConfig, RpcError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| RpcError::Channel(format!("tls setup: {}", e)))?;

    let config = if allow_insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Accepts any server certificate; signatures are still verified
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
