use std::fmt;

use rustls::pki_types::CertificateDer;
use x509_parser::parse_x509_certificate;
use x509_parser::x509::AttributeTypeAndValue;

use crate::error::TlsError;

/// Subject and validity of an X.509 certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertInfo {
    pub common_name: Option<String>,
    /// Full subject distinguished name
    pub subject: String,
    /// Hex serial number
    pub serial: Option<String>,
    pub organization: Option<String>,
    /// Start of the validity period, unix seconds
    pub not_before: i64,
    /// End of the validity period, unix seconds
    pub not_after: i64,
}

impl CertInfo {
    /// Parses a DER encoded certificate, `None` if it is not a valid X.509 structure.
    pub fn from_der(der: &CertificateDer<'_>) -> Option<CertInfo> {
        let (_, cert) = parse_x509_certificate(der.as_ref()).ok()?;
        let subject = cert.subject();
        let validity = cert.validity();
        Some(CertInfo {
            common_name: first_attr(subject.iter_common_name()),
            organization: first_attr(subject.iter_organization()),
            subject: subject.to_string(),
            serial: Some(cert.serial.to_str_radix(16)),
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
        })
    }

    /// Checks the validity period against `now` (unix seconds).
    ///
    /// A certificate that is not yet valid is reported the same way as an expired one.
    pub fn check_validity(&self, now: i64) -> Result<(), TlsError> {
        if now > self.not_after {
            Err(TlsError::ExpiredCertificate(format!(
                "{} expired at {}",
                self.subject,
                smqtt_utils::format_timestamp(self.not_after)
            )))
        } else if now < self.not_before {
            Err(TlsError::ExpiredCertificate(format!(
                "{} is not valid before {}",
                self.subject,
                smqtt_utils::format_timestamp(self.not_before)
            )))
        } else {
            Ok(())
        }
    }
}

fn first_attr<'a, 'b: 'a>(mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>) -> Option<String> {
    attrs.next().and_then(|attr| attr.as_str().ok()).map(str::to_owned)
}

impl fmt::Display for CertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, valid until {}", self.subject, smqtt_utils::format_timestamp(self.not_after))
    }
}

/// Peer certificate of an established TLS stream
pub trait TlsCertExtractor {
    fn extract_cert_info(&self) -> Option<CertInfo>;
}

impl<S> TlsCertExtractor for tokio_rustls::client::TlsStream<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn extract_cert_info(&self) -> Option<CertInfo> {
        let (_, session) = self.get_ref();
        let certs = session.peer_certificates()?;
        CertInfo::from_der(certs.first()?)
    }
}
