#![deny(unsafe_code)]

//! Transport layer of the smqtt client
//!
//! * [`tls`] turns a [`CertificateBundle`] into a mutually authenticated TLS socket
//! * [`cert`] reads subject and validity information out of X.509 certificates
//! * [`MqttStream`] frames MQTT v3.1.1 packets over any `AsyncRead + AsyncWrite` socket

pub mod cert;
mod error;
mod stream;
pub mod tls;

pub use cert::{CertInfo, TlsCertExtractor};
pub use error::{MqttError, TlsError};
pub use stream::MqttStream;
pub use tls::{check_cert_files, create_secure_connection, CertificateBundle, SecureSocket, TlsConnector};

pub type Result<T, E = MqttError> = std::result::Result<T, E>;
