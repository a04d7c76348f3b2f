// ── TLS configuration for transport sockets ──

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::Error;

/// Client-side TLS mode.
///
/// Fabric services usually run inside the cluster perimeter, so plaintext
/// is the default; `insecure` accepts self-signed agent certificates the
/// same way the device agents themselves are dialed.
#[derive(Debug, Clone, Default)]
pub enum ClientTls {
    /// No TLS at all.
    #[default]
    Plaintext,
    /// TLS with a custom CA certificate (PEM file).
    CustomCa(PathBuf),
    /// TLS without certificate verification (self-signed peers).
    DangerAcceptInvalid,
}

impl ClientTls {
    /// Wrap a TCP stream according to the mode. `address` supplies the
    /// SNI host name.
    pub(crate) async fn wrap(
        &self,
        address: &str,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, Error> {
        let config = match self {
            Self::Plaintext => {
                return Err(Error::Tls("wrap called for plaintext mode".into()));
            }
            Self::CustomCa(path) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in read_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("invalid CA certificate: {e}")))?;
                }
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            Self::DangerAcceptInvalid => {
                let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
                rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
                    .with_safe_default_protocol_versions()
                    .map_err(|e| Error::Tls(e.to_string()))?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                    .with_no_client_auth()
            }
        };

        let host = address.split(':').next().unwrap_or(address);
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| Error::Tls(format!("invalid server name {host:?}: {e}")))?;

        let connector = TlsConnector::from(Arc::new(config));
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(format!("TLS handshake failed: {e}")))
    }
}

/// Server-side TLS acceptor built from PEM material.
#[derive(Clone)]
pub struct ServerTls {
    acceptor: TlsAcceptor,
}

impl ServerTls {
    /// Load a certificate chain and private key from PEM files.
    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self, Error> {
        let certs = read_certs(cert)?;
        if certs.is_empty() {
            return Err(Error::Tls(format!("no certificates found in {}", cert.display())));
        }

        let mut key_reader = BufReader::new(
            File::open(key).map_err(|e| Error::Tls(format!("cannot read {}: {e}", key.display())))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| Error::Tls(format!("cannot parse {}: {e}", key.display())))?
            .ok_or_else(|| Error::Tls(format!("no private key found in {}", key.display())))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(format!("invalid certificate/key pair: {e}")))?;

        Ok(Self { acceptor: TlsAcceptor::from(Arc::new(config)) })
    }

    pub(crate) async fn accept(
        &self,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>, Error> {
        self.acceptor
            .accept(tcp)
            .await
            .map_err(|e| Error::Tls(format!("TLS accept failed: {e}")))
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file =
        File::open(path).map_err(|e| Error::Tls(format!("cannot read {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("cannot parse {}: {e}", path.display())))
}

/// Certificate verifier that accepts any peer; signatures are still
/// checked against the negotiated scheme.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
