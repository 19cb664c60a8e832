//! Upstream TLS client configuration
//!
//! Builds the rustls client used by `tls` transport sockets, including the
//! `tls` socket nested inside an `http11-connect` wrapper. The handshake runs
//! over whatever stream the lower layer hands up, so when a tunnel is in use
//! the ClientHello is the first thing sent after the CONNECT response.
//!
//! # Example KDL Configuration
//!
//! ```kdl
//! transport "http11-connect" {
//!     inner "tls" {
//!         sni "api.example.com"
//!         alpn "h2" "http/1.1"
//!         ca-cert "/etc/burrow/ca.pem"
//!         client-cert "/etc/burrow/client.pem"
//!         client-key "/etc/burrow/client.key"
//!     }
//! }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use burrow_config::UpstreamTlsConfig;

/// Error type for TLS operations
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load certificate file
    #[error("Failed to load certificate: {0}")]
    CertificateLoad(String),

    /// Failed to load private key file
    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    /// Failed to build TLS configuration
    #[error("Failed to build TLS config: {0}")]
    ConfigBuild(String),

    /// SNI value is not a valid DNS name or IP address
    #[error("Invalid server name '{0}'")]
    InvalidServerName(String),

    /// Handshake with the upstream failed
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}

/// The crypto provider installed for the process, or aws-lc-rs
fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Load CA certificates used to verify upstream servers
pub fn load_ca_certs(ca_path: &Path) -> Result<RootCertStore, TlsError> {
    let ca_file = File::open(ca_path)
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", ca_path.display(), e)))?;
    let mut ca_reader = BufReader::new(ca_file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut ca_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", ca_path.display(), e)))?;

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateLoad(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    if root_store.is_empty() {
        return Err(TlsError::CertificateLoad(format!(
            "{}: No CA certificates found",
            ca_path.display()
        )));
    }

    debug!(
        ca_file = %ca_path.display(),
        cert_count = root_store.len(),
        "Loaded upstream CA certificates"
    );

    Ok(root_store)
}

/// Platform trust store, skipping certificates that fail to parse
fn native_roots() -> Result<RootCertStore, TlsError> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        warn!(error = %err, "Skipping unreadable native certificate");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(result.certs);
    if roots.is_empty() {
        return Err(TlsError::ConfigBuild(
            "no usable native root certificates; set ca-cert".to_string(),
        ));
    }
    debug!(added, ignored, "Loaded native root certificates");
    Ok(roots)
}

/// Load a client certificate chain and private key for mTLS
pub fn load_client_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", cert_path.display(), e)))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                TlsError::CertificateLoad(format!("{}: {}", cert_path.display(), e))
            })?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad(format!(
            "{}: No certificates found in file",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| TlsError::KeyLoad(format!("{}: {}", key_path.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| TlsError::KeyLoad(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            TlsError::KeyLoad(format!("{}: No private key found in file", key_path.display()))
        })?;

    Ok((certs, key))
}

/// Build a rustls ClientConfig from an upstream TLS configuration
pub fn build_client_config(config: &UpstreamTlsConfig) -> Result<ClientConfig, TlsError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::ConfigBuild(e.to_string()))?;

    let builder = if config.insecure_skip_verify {
        warn!("Upstream TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier::new(provider)))
    } else {
        let roots = match &config.ca_cert {
            Some(path) => load_ca_certs(path)?,
            None => native_roots()?,
        };
        builder.with_root_certificates(roots)
    };

    let mut client_config = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => {
            let (certs, key) = load_client_identity(cert, key)?;
            info!(client_cert = %cert.display(), "Using upstream client certificate");
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::ConfigBuild(format!("client certificate: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TlsError::ConfigBuild(
                "client-cert and client-key must be set together".to_string(),
            ))
        }
    };

    client_config.alpn_protocols = config
        .alpn
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(client_config)
}

/// TLS layer of an upstream transport stack
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
    sni: Option<ServerName<'static>>,
}

impl std::fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTls")
            .field("sni", &self.sni)
            .finish_non_exhaustive()
    }
}

impl UpstreamTls {
    pub fn from_config(config: &UpstreamTlsConfig) -> Result<Self, TlsError> {
        let client_config = build_client_config(config)?;
        let sni = config.sni.as_deref().map(server_name).transpose()?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            sni,
        })
    }

    /// Configured SNI, if any
    pub fn sni(&self) -> Option<&ServerName<'static>> {
        self.sni.as_ref()
    }

    /// Run the client handshake over `io`.
    ///
    /// `fallback_host` supplies the server name when no SNI is configured.
    pub async fn handshake<S>(&self, io: S, fallback_host: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = match &self.sni {
            Some(name) => name.clone(),
            None => server_name(fallback_host)?,
        };
        self.connector
            .connect(name, io)
            .await
            .map_err(TlsError::Handshake)
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::InvalidServerName(host.to_string()))
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Certificate verifier that accepts any server certificate.
    ///
    /// **DANGEROUS:** only for testing with self-signed certificates.
    /// Handshake signatures are still checked.
    #[derive(Debug)]
    pub(super) struct NoVerifier(Arc<CryptoProvider>);

    impl NoVerifier {
        pub(super) fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoVerifier {
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
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
