//! QUIC endpoints (quinn + rustls).
//!
//! The server presents a freshly generated self-signed certificate. Clients
//! skip certificate verification; session trust comes from the
//! initialization handshake, not from TLS identity.
//!
//! Socket liveness is left to quinn: both sides send keep-alives and drop a
//! link that stays silent for [`LinkTimings::idle_timeout`].

use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// ALPN identifier negotiated by both sides.
pub const ALPN: &[u8] = b"hullsync";

/// Keep-alives sent per idle window.
const KEEP_ALIVES_PER_WINDOW: u32 = 3;

/// Liveness timings of a socket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    /// Silence after which the link is dropped.
    pub idle_timeout: Duration,
    /// Interval between keep-alive packets.
    pub keep_alive: Duration,
}

impl LinkTimings {
    /// Timings for a link dropped after `idle_timeout` of silence.
    pub fn from_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            keep_alive: idle_timeout / KEEP_ALIVES_PER_WINDOW,
        }
    }

    fn transport_config(&self) -> Result<Arc<TransportConfig>> {
        let idle: quinn::IdleTimeout = self
            .idle_timeout
            .try_into()
            .context("Idle timeout out of range for QUIC")?;
        let mut transport = TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive));
        transport.max_idle_timeout(Some(idle));
        Ok(Arc::new(transport))
    }
}

/// Listening QUIC endpoint.
pub struct ServerEndpoint {
    endpoint: Endpoint,
    addr: SocketAddr,
    timings: LinkTimings,
}

impl ServerEndpoint {
    /// Bind to `addr` with a self-signed certificate.
    pub fn bind(addr: SocketAddr, timings: LinkTimings) -> Result<Self> {
        let mut config = ServerConfig::with_crypto(Arc::new(server_crypto()?));
        config.transport_config(timings.transport_config()?);

        let endpoint = Endpoint::server(config, addr).context("Failed to bind server endpoint")?;
        let addr = endpoint.local_addr()?;
        info!(%addr, idle = ?timings.idle_timeout, "Server endpoint listening");

        Ok(Self {
            endpoint,
            addr,
            timings,
        })
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Liveness timings applied to accepted links.
    pub fn timings(&self) -> LinkTimings {
        self.timings
    }

    /// Wait for the next incoming connection; `None` once closed.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutting down");
    }
}

/// Outgoing QUIC endpoint, used by tools and tests that play the client.
pub struct ClientEndpoint {
    endpoint: Endpoint,
}

impl ClientEndpoint {
    /// Create a client endpoint on an ephemeral port.
    pub fn new(timings: LinkTimings) -> Result<Self> {
        let mut config = ClientConfig::new(Arc::new(client_crypto()?));
        config.transport_config(timings.transport_config()?);

        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        endpoint.set_default_client_config(config);
        debug!(addr = %endpoint.local_addr()?, "Client endpoint bound");

        Ok(Self { endpoint })
    }

    /// Connect to a server.
    pub async fn connect(&self, server_addr: SocketAddr) -> Result<quinn::Connection> {
        self.endpoint
            .connect(server_addr, "localhost")
            .context("Failed to initiate connection")?
            .await
            .with_context(|| format!("Failed to connect to {server_addr}"))
    }
}

fn install_crypto_provider() {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn server_crypto() -> Result<quinn::crypto::rustls::QuicServerConfig> {
    install_crypto_provider();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate certificate")?;
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![CertificateDer::from(cert.cert)], key)
        .context("Failed to build rustls ServerConfig")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    quinn::crypto::rustls::QuicServerConfig::try_from(crypto).context("Failed to create QuicServerConfig")
}

fn client_crypto() -> Result<quinn::crypto::rustls::QuicClientConfig> {
    install_crypto_provider();
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    quinn::crypto::rustls::QuicClientConfig::try_from(crypto).context("Failed to create QuicClientConfig")
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
