use crate::error::{AcmeErrorKind, PkiError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
    Ip,
}

/// An identifier as it appears on an order: DNS wildcards keep their `*.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AcmeIdentifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawIdentifier {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

impl AcmeIdentifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Dns,
            value: value.into(),
        }
    }

    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Ip,
            value: value.into(),
        }
    }

    /// Value without a leading wildcard label, plus whether one was present.
    pub fn base_value(&self) -> (&str, bool) {
        match self.value.strip_prefix("*.") {
            Some(rest) if self.kind == IdentifierType::Dns => (rest, true),
            _ => (self.value.as_str(), false),
        }
    }
}

pub(crate) fn validate_raw(raw: &[RawIdentifier]) -> Result<Vec<AcmeIdentifier>> {
    if raw.is_empty() {
        return Err(malformed("an order needs at least one identifier"));
    }
    let mut identifiers = raw
        .iter()
        .map(|identifier| match identifier.kind.as_str() {
            "dns" => normalize_dns(&identifier.value),
            "ip" => normalize_ip(&identifier.value),
            other => Err(PkiError::acme(
                AcmeErrorKind::UnsupportedIdentifier,
                format!("identifier type {} is not supported", other),
            )),
        })
        .collect::<Result<Vec<_>>>()?;
    identifiers.sort();
    identifiers.dedup();
    Ok(identifiers)
}

/// Splits off a leading `*.` and requires the rest to survive an IDNA
/// ASCII round trip unchanged.
pub fn normalize_dns(value: &str) -> Result<AcmeIdentifier> {
    let (base, wildcard) = match value.strip_prefix("*.") {
        Some(rest) => (rest, true),
        None => (value, false),
    };
    if base.is_empty() || base.contains('*') {
        return Err(malformed(format!("invalid DNS identifier {}", value)));
    }
    if base.parse::<IpAddr>().is_ok() {
        return Err(malformed(format!("DNS identifier {} is an IP address", value)));
    }

    let ascii = idna::domain_to_ascii_strict(base)
        .map_err(|_| malformed(format!("DNS identifier {} is not a valid IDNA name", value)))?;
    if ascii != base {
        return Err(malformed(format!(
            "DNS identifier {} is not in canonical ASCII form",
            value
        )));
    }

    let value = if wildcard {
        format!("*.{}", base)
    } else {
        base.to_string()
    };
    Ok(AcmeIdentifier::dns(value))
}

pub fn normalize_ip(value: &str) -> Result<AcmeIdentifier> {
    let ip: IpAddr = value
        .parse()
        .map_err(|_| malformed(format!("invalid IP identifier {}", value)))?;
    Ok(AcmeIdentifier::ip(ip.to_string()))
}

/// Deduplicated, lexicographically sorted (dns, ip) value lists used to
/// compare an order against a CSR.
pub fn identifier_sets(identifiers: &[AcmeIdentifier]) -> (Vec<String>, Vec<String>) {
    let mut dns = Vec::new();
    let mut ips = Vec::new();
    for identifier in identifiers {
        match identifier.kind {
            IdentifierType::Dns => dns.push(identifier.value.clone()),
            IdentifierType::Ip => ips.push(identifier.value.clone()),
        }
    }
    sort_dedup(&mut dns);
    sort_dedup(&mut ips);
    (dns, ips)
}

pub fn sort_dedup(values: &mut Vec<String>) {
    values.sort();
    values.dedup();
}

fn malformed(detail: impl Into<String>) -> PkiError {
    PkiError::acme(AcmeErrorKind::Malformed, detail)
}
