//! TLS configuration helpers
//!
//! Thin wrappers over rustls: the server accepts through a
//! `TlsAcceptor` built from [`server_tls_config`], the client dials
//! through a `TlsConnector` built from [`client_tls_config`]. Both
//! floor the protocol version at TLS 1.2. Certificate management is out
//! of scope; PEM files come from wherever the host process keeps them.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

/// Protocol versions offered: TLS 1.3 and 1.2, nothing older.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// TLS configuration errors.
#[derive(Debug)]
pub enum TlsError {
    /// Reading a PEM file failed.
    Io(io::Error),
    /// The certificate file contained no certificates.
    NoCertificate,
    /// The key file contained no private key.
    NoPrivateKey,
    /// Neither a root CA file nor insecure verification was configured.
    MissingRoots,
    /// rustls rejected the configuration.
    Rustls(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Io(err) => write!(f, "tls io error: {}", err),
            TlsError::NoCertificate => write!(f, "no certificate found in PEM file"),
            TlsError::NoPrivateKey => write!(f, "no private key found in PEM file"),
            TlsError::MissingRoots => {
                write!(f, "a root CA file is required unless insecure verification is enabled")
            }
            TlsError::Rustls(err) => write!(f, "tls config error: {}", err),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io(err) => Some(err),
            TlsError::Rustls(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> Self {
        TlsError::Io(err)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(err: rustls::Error) -> Self {
        TlsError::Rustls(err)
    }
}

/// Build a server-side TLS config from PEM certificate and key files.
pub fn server_tls_config(
    cert_pem: impl AsRef<Path>,
    key_pem: impl AsRef<Path>,
) -> Result<rustls::ServerConfig, TlsError> {
    let mut cert_reader = BufReader::new(File::open(cert_pem)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let mut key_reader = BufReader::new(File::open(key_pem)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::NoPrivateKey)?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Build a client-side TLS config.
///
/// With `root_ca_pem` the server certificate is verified against that
/// root. With `insecure` any certificate is accepted; only for test
/// rigs and local development.
pub fn client_tls_config(
    root_ca_pem: Option<&Path>,
    insecure: bool,
) -> Result<rustls::ClientConfig, TlsError> {
    if insecure {
        let config = rustls::ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
            .with_no_client_auth();
        return Ok(config);
    }

    let path = root_ca_pem.ok_or(TlsError::MissingRoots)?;
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }

    let config = rustls::ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Verifier that accepts any server certificate while still checking
/// handshake signatures. The TLS channel stays encrypted but is open to
/// an active man in the middle.
#[derive(Debug)]
struct InsecureVerifier {
    provider: CryptoProvider,
}

impl InsecureVerifier {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_insecure_client_config_builds() {
        let config = client_tls_config(None, true).unwrap();
        // TLS 1.2 is the floor.
        assert!(config
            .crypto_provider()
            .cipher_suites
            .iter()
            .any(|s| s.version().version == rustls::ProtocolVersion::TLSv1_2));
    }

    #[test]
    fn test_secure_client_config_requires_roots() {
        assert!(matches!(
            client_tls_config(None, false),
            Err(TlsError::MissingRoots)
        ));
    }

    #[test]
    fn test_server_config_missing_files() {
        let err = server_tls_config("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(err, Err(TlsError::Io(_))));
    }

    #[test]
    fn test_server_config_rejects_empty_pem() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"not a pem").unwrap();
        key.write_all(b"not a pem").unwrap();

        let err = server_tls_config(cert.path(), key.path());
        assert!(matches!(err, Err(TlsError::NoCertificate)));
    }

    #[test]
    fn test_client_config_rejects_empty_ca_file() {
        let ca = tempfile::NamedTempFile::new().unwrap();
        let err = client_tls_config(Some(ca.path()), false);
        assert!(matches!(err, Err(TlsError::NoCertificate)));
    }
}
