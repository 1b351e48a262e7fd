//! Health of the kubelet serving certificate.
//!
//! The certificate is checked for presence, format, validity window and
//! issuer. Every failure is a distinct [`CertificateError`] kind with its
//! own remediation; callers match on the kind to decide whether it is
//! fatal.
use std::io;
use std::path::Path;

use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;

use crate::remediation::with_remediation;

pub const KUBELET_CERT_PATH: &str = "/var/lib/kubelet/pki/kubelet-server-current.pem";

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("kubelet certificate not found at {0}")]
    NotFound(String),
    #[error("could not access kubelet certificate at {path}: {source}")]
    FileError { path: String, source: io::Error },
    #[error("could not read kubelet certificate at {path}: {source}")]
    ReadError { path: String, source: io::Error },
    #[error("kubelet certificate at {0} is not a valid PEM encoded X.509 certificate")]
    InvalidFormat(String),
    #[error("kubelet certificate is not valid yet, the system clock may be skewed")]
    ClockSkew,
    #[error("kubelet certificate has expired")]
    Expired,
    #[error("could not parse the cluster certificate authority")]
    ParseCA,
    #[error("kubelet certificate was not issued by the cluster certificate authority")]
    InvalidCA,
}

impl CertificateError {
    pub fn remediation(&self) -> &'static str {
        match self {
            CertificateError::NotFound(_) => {
                "Kubelet creates its serving certificate after it registers with the cluster. If this persists, check the kubelet logs."
            }
            CertificateError::FileError { .. } | CertificateError::ReadError { .. } => {
                "Ensure the kubelet certificate file is readable by root."
            }
            CertificateError::InvalidFormat(_) => {
                "Remove the corrupted kubelet certificate and restart kubelet to request a new one."
            }
            CertificateError::ClockSkew => {
                "Synchronize the system clock with NTP, then restart kubelet."
            }
            CertificateError::Expired => {
                "Remove the expired kubelet certificate and restart kubelet to request a new one."
            }
            CertificateError::ParseCA => {
                "Ensure spec.cluster.certificateAuthority holds the base64 encoded PEM certificate authority of the cluster."
            }
            CertificateError::InvalidCA => {
                "The node was likely moved between clusters. Remove /var/lib/kubelet/pki and restart kubelet to get a certificate from the current cluster."
            }
        }
    }

    /// During init kubelet replaces a missing or not-yet-valid certificate
    /// itself, so those outcomes are reported but do not fail the command.
    pub fn fatal_at_init(&self) -> bool {
        !matches!(
            self,
            CertificateError::NotFound(_) | CertificateError::ClockSkew | CertificateError::Expired
        )
    }
}

/// Checks the certificate at `path` against the CA bundle at time `now`
/// (seconds since the epoch).
pub fn validate_certificate(path: &Path, ca_pem: &[u8], now: i64) -> Result<(), CertificateError> {
    let display = path.display().to_string();
    match std::fs::metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CertificateError::NotFound(display));
        }
        Err(source) => {
            return Err(CertificateError::FileError {
                path: display,
                source,
            });
        }
    }
    let data = std::fs::read(path).map_err(|source| CertificateError::ReadError {
        path: display.clone(),
        source,
    })?;

    let pem = first_certificate(&data).ok_or_else(|| CertificateError::InvalidFormat(display.clone()))?;
    let cert = pem
        .parse_x509()
        .map_err(|_| CertificateError::InvalidFormat(display.clone()))?;

    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(CertificateError::ClockSkew);
    }
    if now > validity.not_after.timestamp() {
        return Err(CertificateError::Expired);
    }

    let authorities = Pem::iter_from_buffer(ca_pem)
        .filter_map(Result::ok)
        .filter(|pem| pem.label == "CERTIFICATE")
        .collect::<Vec<_>>();
    if authorities.is_empty() {
        return Err(CertificateError::ParseCA);
    }
    let mut parsed = Vec::new();
    for pem in &authorities {
        parsed.push(pem.parse_x509().map_err(|_| CertificateError::ParseCA)?);
    }
    if !parsed.iter().any(|ca| issued_by(&cert, ca)) {
        return Err(CertificateError::InvalidCA);
    }
    Ok(())
}

fn first_certificate(data: &[u8]) -> Option<Pem> {
    Pem::iter_from_buffer(data)
        .filter_map(Result::ok)
        .find(|pem| pem.label == "CERTIFICATE")
}

fn issued_by(cert: &X509Certificate, ca: &X509Certificate) -> bool {
    cert.verify_signature(Some(ca.public_key())).is_ok()
}

/// Wraps a certificate failure with its remediation.
pub fn into_remediated(err: CertificateError) -> anyhow::Error {
    let fix = err.remediation();
    with_remediation(err, fix)
}
