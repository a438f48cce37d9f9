//! Mutually authenticated TLS sockets
//!
//! A [`CertificateBundle`] holds the CA certificate used to verify the broker together with
//! the client certificate chain and private key presented to it. [`TlsConnector`] checks the
//! bundle once, builds a `rustls::ClientConfig` from it and then opens one TCP+TLS socket per
//! [`TlsConnector::connect`] call.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[cfg(not(target_os = "windows"))]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::sign::CertifiedKey;
use rustls::{AlertDescription, ClientConfig, InconsistentKeys, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::cert::CertInfo;
use crate::error::TlsError;

/// Socket produced by [`TlsConnector::connect`]
pub type SecureSocket = TlsStream<TcpStream>;

/// CA certificate, client certificate chain and client private key
pub struct CertificateBundle {
    ca_certs: Vec<CertificateDer<'static>>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertificateBundle {
    /// Loads the bundle from PEM encoded bytes.
    pub fn from_pem(ca_cert: &[u8], client_cert: &[u8], client_key: &[u8]) -> Result<Self, TlsError> {
        let ca_certs = CertificateDer::pem_slice_iter(ca_cert)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidIdentity(format!("bad CA certificate, {}", e)))?;
        let cert_chain = CertificateDer::pem_slice_iter(client_cert)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidIdentity(format!("bad client certificate, {}", e)))?;
        let key = PrivateKeyDer::from_pem_slice(client_key)
            .map_err(|e| TlsError::InvalidIdentity(format!("bad client private key, {}", e)))?;
        Self::new(ca_certs, cert_chain, key)
    }

    /// Loads the bundle from PEM files, every file must exist and be readable.
    pub fn from_pem_files<P: AsRef<Path>>(ca_cert: P, client_cert: P, client_key: P) -> Result<Self, TlsError> {
        check_cert_files(&[ca_cert.as_ref(), client_cert.as_ref(), client_key.as_ref()])?;

        let ca_certs = CertificateDer::pem_file_iter(ca_cert.as_ref())
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|e| {
                TlsError::InvalidIdentity(format!("bad CA certificate {}, {}", ca_cert.as_ref().display(), e))
            })?;
        let cert_chain = CertificateDer::pem_file_iter(client_cert.as_ref())
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|e| {
                TlsError::InvalidIdentity(format!(
                    "bad client certificate {}, {}",
                    client_cert.as_ref().display(),
                    e
                ))
            })?;
        let key = PrivateKeyDer::from_pem_file(client_key.as_ref()).map_err(|e| {
            TlsError::InvalidIdentity(format!("bad client private key {}, {}", client_key.as_ref().display(), e))
        })?;
        Self::new(ca_certs, cert_chain, key)
    }

    fn new(
        ca_certs: Vec<CertificateDer<'static>>,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        if ca_certs.is_empty() {
            return Err(TlsError::InvalidIdentity("no CA certificate found".into()));
        }
        if cert_chain.is_empty() {
            return Err(TlsError::InvalidIdentity("no client certificate found".into()));
        }
        Ok(Self { ca_certs, cert_chain, key })
    }

    /// Information about the leaf client certificate
    pub fn client_cert_info(&self) -> Option<CertInfo> {
        self.cert_chain.first().and_then(CertInfo::from_der)
    }

    /// Checks the client certificate validity period and that the private key belongs to it.
    pub fn validate(&self) -> Result<CertInfo, TlsError> {
        let info = self
            .client_cert_info()
            .ok_or_else(|| TlsError::InvalidIdentity("client certificate is not valid X.509".into()))?;
        info.check_validity(smqtt_utils::timestamp_secs())?;

        let signing_key = provider::default_provider()
            .key_provider
            .load_private_key(self.key.clone_key())
            .map_err(|e| TlsError::InvalidIdentity(format!("unsupported client private key, {}", e)))?;
        match CertifiedKey::new(self.cert_chain.clone(), signing_key).keys_match() {
            Ok(()) => {}
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
                log::debug!("unable to compare the client key with certificate {}", info.subject);
            }
            Err(e) => {
                return Err(TlsError::InvalidIdentity(format!(
                    "client key does not match certificate {}, {}",
                    info.subject, e
                )))
            }
        }
        Ok(info)
    }

    /// Builds the rustls client configuration trusting only the bundled CA.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let mut roots = RootCertStore::empty();
        for ca in self.ca_certs.iter() {
            roots.add(ca.clone()).map_err(|e| TlsError::InvalidIdentity(format!("bad CA certificate, {}", e)))?;
        }

        let provider = Arc::new(provider::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| TlsError::InvalidIdentity(format!("bad certs/private key, {}", e)))?;
        Ok(Arc::new(config))
    }
}

impl Clone for CertificateBundle {
    fn clone(&self) -> Self {
        Self { ca_certs: self.ca_certs.clone(), cert_chain: self.cert_chain.clone(), key: self.key.clone_key() }
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("ca_certs", &self.ca_certs.len())
            .field("cert_chain", &self.cert_chain.len())
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// Fails with the name of the first file that is missing or cannot be opened.
pub fn check_cert_files(files: &[&Path]) -> Result<(), TlsError> {
    for file in files {
        if !file.exists() {
            return Err(TlsError::InvalidIdentity(format!("certificate file not found: {}", file.display())));
        }
        if let Err(e) = File::open(file) {
            return Err(TlsError::InvalidIdentity(format!(
                "certificate file is not readable: {}, {}",
                file.display(),
                e
            )));
        }
    }
    Ok(())
}

/// Opens TCP+TLS connections to one broker
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
    timeout: Duration,
}

impl TlsConnector {
    /// Validates `bundle` and prepares the TLS configuration.
    ///
    /// `server_name` is the name the broker certificate is verified against, it defaults to
    /// `host`. `timeout` bounds the TCP connect and the TLS handshake separately.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        bundle: &CertificateBundle,
        server_name: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TlsError> {
        let host = host.into();
        let name = server_name.unwrap_or(host.as_str()).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| TlsError::HandshakeFailed(format!("invalid server name {}, {}", name, e)))?;

        let info = bundle.validate()?;
        log::debug!("client certificate {}, valid until {}", info, smqtt_utils::format_timestamp(info.not_after));

        let config = bundle.client_config()?;
        Ok(Self { host, port, server_name, config, timeout })
    }

    #[inline]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Opens one TCP connection and runs the TLS handshake over it.
    ///
    /// The socket is dropped on every failure path.
    pub async fn connect(&self) -> Result<SecureSocket, TlsError> {
        let addr = self.addr();
        let tcp = match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(TlsError::Unreachable(format!("{}, {}", addr, e))),
            Err(_) => return Err(TlsError::Unreachable(format!("{}, connect timeout", addr))),
        };
        if let Err(e) = tcp.set_nodelay(true) {
            log::warn!("{} set nodelay error, {}", addr, e);
        }

        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        match tokio::time::timeout(self.timeout, connector.connect(self.server_name.clone(), tcp)).await {
            Ok(Ok(socket)) => {
                log::debug!("{} tls handshake completed", addr);
                Ok(socket)
            }
            Ok(Err(e)) => Err(classify_io_error(&e)),
            Err(_) => Err(TlsError::HandshakeFailed(format!("{}, handshake timeout", addr))),
        }
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("addr", &self.addr())
            .field("server_name", &self.server_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Validates `bundle` and opens one secure socket to `host:port`.
pub async fn create_secure_connection(
    host: &str,
    port: u16,
    bundle: &CertificateBundle,
    server_name: Option<&str>,
    timeout: Duration,
) -> Result<SecureSocket, TlsError> {
    TlsConnector::new(host, port, bundle, server_name, timeout)?.connect().await
}

/// Maps a rustls failure onto the transport error taxonomy
pub fn classify_rustls_error(err: &rustls::Error) -> TlsError {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => match AlertDescription::from(cert_err.clone()) {
            AlertDescription::CertificateExpired => TlsError::ExpiredCertificate(err.to_string()),
            _ => TlsError::UntrustedServer(err.to_string()),
        },
        rustls::Error::AlertReceived(AlertDescription::CertificateExpired) => {
            TlsError::ExpiredCertificate(err.to_string())
        }
        _ => TlsError::HandshakeFailed(err.to_string()),
    }
}

/// tokio-rustls wraps rustls errors into `io::Error`
pub fn classify_io_error(e: &io::Error) -> TlsError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(err) => classify_rustls_error(err),
        None => TlsError::HandshakeFailed(e.to_string()),
    }
}
