use crate::error::{PkiError, Result};
use crate::pki::serial::serial_from_bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::net::IpAddr;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

pub const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// Fields the engine needs out of a parsed certificate.
#[derive(Debug, Clone)]
pub struct CertDetails {
    pub der: Vec<u8>,
    pub serial: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub self_issued: bool,
    pub subject_key_id: Option<Vec<u8>>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Contents of the subjectPublicKey BIT STRING.
    pub public_key: Vec<u8>,
}

impl CertDetails {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| PkiError::InvalidCertificate {
            reason: format!("Failed to parse certificate DER: {}", e),
        })?;

        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        let mut subject_key_id = None;
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectKeyIdentifier(ski) = ext.parsed_extension() {
                subject_key_id = Some(ski.0.to_vec());
            }
        }

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_octets(raw) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let public_key: &[u8] = &cert.public_key().subject_public_key.data;

        Ok(Self {
            der: der.to_vec(),
            serial: serial_from_bytes(cert.raw_serial()),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: timestamp_to_utc(cert.validity().not_before.timestamp())?,
            not_after: timestamp_to_utc(cert.validity().not_after.timestamp())?,
            is_ca,
            self_issued: cert.subject().as_raw() == cert.issuer().as_raw(),
            subject_key_id,
            dns_names,
            ip_addresses,
            public_key: public_key.to_vec(),
        })
    }

    pub fn from_pem(pem_str: &str) -> Result<Self> {
        Self::from_der(&pem_to_der(pem_str, CERTIFICATE_PEM_TAG)?)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after < now
    }

    pub fn to_pem(&self) -> String {
        der_to_pem(CERTIFICATE_PEM_TAG, &self.der)
    }
}

/// True when `cert_der` carries a valid signature made by the key in
/// `issuer_der`. Parse failures count as "not signed by".
pub fn is_signed_by(cert_der: &[u8], issuer_der: &[u8]) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };
    let Ok((_, issuer)) = X509Certificate::from_der(issuer_der) else {
        return false;
    };
    cert.verify_signature(Some(issuer.public_key())).is_ok()
}

pub fn timestamp_to_utc(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| PkiError::InvalidCertificate {
            reason: format!("timestamp out of range: {}", secs),
        })
}

pub fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

pub fn der_to_pem(tag: &str, der: &[u8]) -> String {
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    pem::encode_config(&pem::Pem::new(tag, der.to_vec()), config)
}

/// Decodes the first PEM block with the given tag.
pub fn pem_to_der(pem_str: &str, tag: &str) -> Result<Vec<u8>> {
    let blocks = pem::parse_many(pem_str).map_err(|e| PkiError::InvalidCertificate {
        reason: format!("Failed to parse PEM: {}", e),
    })?;
    blocks
        .into_iter()
        .find(|block| block.tag() == tag)
        .map(|block| block.into_contents())
        .ok_or_else(|| PkiError::InvalidCertificate {
            reason: format!("No {} block found in PEM data", tag),
        })
}
