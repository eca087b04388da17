//! TCP and TLS setup for the session socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionMode, Endpoint};
use crate::error::{Error, Result};

/// Byte stream the session runs over: TLS, plain TCP, or an in-memory pipe in tests.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Install the ring provider as the process default (once).
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Server certificate check for `dangerous_insecure_tls`: the chain is taken
/// on trust, handshake signatures are still checked against the certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        signed: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, signed, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        signed: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, signed, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn unverified_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth()
}

fn native_roots_client_config() -> Result<ClientConfig> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!(error = %e, "Skipping unreadable system certificate source");
    }
    if loaded.certs.is_empty() {
        return Err(Error::Tls(
            "no system root certificates found; install a CA bundle".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, ignored, "Loaded system root certificates");
    if added == 0 {
        return Err(Error::Tls("no usable system root certificates".to_string()));
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Connector for the session socket. `insecure` skips certificate validation.
pub(crate) fn create_tls_connector(insecure: bool) -> Result<TlsConnector> {
    init_crypto_provider();

    let config = if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        unverified_client_config()
    } else {
        native_roots_client_config()?
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn upgrade_to_tls(
    tcp_stream: TcpStream,
    server_name: &str,
    insecure: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = create_tls_connector(insecure)?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {:?}: {}", server_name, e)))?;

    connector.connect(name, tcp_stream).await.map_err(|e| {
        error!(server_name, error = %e, "TLS handshake failed");
        Error::Tls(format!("handshake with {} failed: {}", server_name, e))
    })
}

/// Open the socket for `endpoint`, bounded by `connect_timeout`.
pub async fn connect(
    endpoint: &Endpoint,
    connect_timeout: Duration,
    insecure_tls: bool,
) -> Result<Box<dyn SessionStream>> {
    let tcp_stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| {
        error!(
            host = %endpoint.host, port = endpoint.port,
            timeout_secs = connect_timeout.as_secs(),
            "TCP connect timed out"
        );
        Error::TimedOut(connect_timeout)
    })?
    .map_err(|e| {
        error!(
            host = %endpoint.host, port = endpoint.port,
            error = %e, error_kind = ?e.kind(),
            "TCP connect failed"
        );
        Error::Io(e)
    })?;
    let _ = tcp_stream.set_nodelay(true);

    match endpoint.mode {
        ConnectionMode::Plain => {
            warn!(host = %endpoint.host, port = endpoint.port, "Connected without TLS");
            Ok(Box::new(tcp_stream))
        }
        ConnectionMode::DirectTls => {
            let tls_stream = upgrade_to_tls(tcp_stream, endpoint.tls_name(), insecure_tls).await?;
            info!(host = %endpoint.host, port = endpoint.port,
                tls_name = endpoint.tls_name(), "Connected (direct TLS)");
            Ok(Box::new(tls_stream))
        }
    }
}
