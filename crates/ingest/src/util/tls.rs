use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::error::{IngestError, IngestResult};

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// A plain or TLS byte stream.
pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Accepts any certificate, still checking handshake signatures.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn client_config(strict: bool) -> IngestResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| IngestError::Dial(format!("TLS setup failed: {e}")))?;

    let config = if strict {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Opens a TCP connection, wrapped in TLS when `tls` is set.
pub async fn connect(host: &str, port: u16, tls: bool, strict: bool) -> IngestResult<BoxedStream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| IngestError::Dial(format!("connect {host}:{port}: {e}")))?;
    tcp.set_nodelay(true)?;

    if !tls {
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(Arc::new(client_config(strict)?));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| IngestError::Dial(format!("invalid TLS server name {host}: {e}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| IngestError::Dial(format!("TLS handshake with {host}: {e}")))?;
    Ok(Box::new(stream))
}
