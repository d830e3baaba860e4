//! Issuer creation and the certificate signing path.
//!
//! Keys are generated and serialized through rcgen. A stored issuer is turned
//! back into an rcgen signer with `CertificateParams::from_ca_cert_der`, so
//! the original subject and key are reused for every certificate it signs.

use crate::config::IssuanceConfig;
use crate::error::{PkiError, Result};
use crate::pki::cert_store::CertStore;
use crate::pki::certutil::{der_to_pem, pem_to_der, CertDetails, CERTIFICATE_PEM_TAG};
use crate::pki::issuer::{
    default_usage, IssuerEntry, IssuerId, IssuerStore, KeyEntry, KeyId, LeafNotAfterBehavior,
};
use crate::pki::keys::{generate_key_pair, load_key_pair, KeyType};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, CertificateSigningRequest,
    DistinguishedName, DnType, SanType,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const PRIVATE_KEY_PEM_TAG: &str = "PRIVATE KEY";
const BACKDATE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRootRequest {
    pub common_name: String,
    #[serde(default)]
    pub issuer_name: String,
    #[serde(default)]
    pub key_name: String,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default, with = "crate::config::humantime_serde::option")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerResponse {
    pub issuer_id: IssuerId,
    pub issuer_name: String,
    pub key_id: Option<KeyId>,
    pub certificate: String,
    pub serial_number: String,
    pub ca_chain: Vec<String>,
}

impl From<&IssuerEntry> for IssuerResponse {
    fn from(issuer: &IssuerEntry) -> Self {
        Self {
            issuer_id: issuer.id.clone(),
            issuer_name: issuer.name.clone(),
            key_id: issuer.key_id.clone(),
            certificate: issuer.certificate.clone(),
            serial_number: issuer.serial_number.clone(),
            ca_chain: issuer.ca_chain.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntermediateCsrRequest {
    pub common_name: String,
    #[serde(default)]
    pub key_name: String,
    #[serde(default)]
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateCsrResponse {
    pub csr: String,
    pub key_id: KeyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResponse {
    pub imported_issuers: Vec<IssuerId>,
    pub imported_keys: Vec<KeyId>,
    pub existing_issuers: Vec<IssuerId>,
    pub existing_keys: Vec<KeyId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueRequest {
    #[serde(default)]
    pub issuer_ref: String,
    pub common_name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub ip_sans: Vec<IpAddr>,
    #[serde(default, with = "crate::config::humantime_serde::option")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub key_type: KeyType,
}

/// Overrides applied when signing a CSR verbatim.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub ttl: Option<Duration>,
    /// Replaces the CSR's SANs when set.
    pub dns_names: Option<Vec<String>>,
    pub ip_addresses: Option<Vec<IpAddr>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub private_key: Option<String>,
    pub serial_number: String,
    pub expiration: DateTime<Utc>,
    pub issuer_id: IssuerId,
    pub issuing_ca: String,
    pub ca_chain: Vec<String>,
}

/// Creates issuers and signs certificates with them.
#[derive(Clone)]
pub struct CertificateAuthority {
    issuers: IssuerStore,
    certs: CertStore,
    config: IssuanceConfig,
}

impl CertificateAuthority {
    pub fn new(issuers: IssuerStore, certs: CertStore, config: IssuanceConfig) -> Self {
        Self {
            issuers,
            certs,
            config,
        }
    }

    pub async fn generate_root(&self, request: GenerateRootRequest) -> Result<IssuerResponse> {
        if request.common_name.trim().is_empty() {
            return Err(PkiError::InvalidRequest("common_name is required".to_string()));
        }
        self.ensure_issuer_name_free(&request.issuer_name).await?;

        let key_pair = generate_key_pair(request.key_type)?;
        let private_key_pem = key_pair.serialize_pem();

        let now = Utc::now();
        let ttl = request.ttl.unwrap_or(self.config.root_ttl);
        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name = common_name_dn(&request.common_name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = ca_key_usages();
        params.alg = request.key_type.algorithm();
        params.serial_number = Some(random_serial());
        params.not_before = to_offset(now - chrono_duration(BACKDATE)?)?;
        params.not_after = to_offset(now + chrono_duration(ttl)?)?;
        params.key_pair = Some(key_pair);

        let certificate = RcgenCertificate::from_params(params).map_err(|e| {
            PkiError::InvalidCertificate {
                reason: format!("Failed to generate root CA: {}", e),
            }
        })?;
        let der = certificate.serialize_der()?;

        let key = KeyEntry {
            id: Uuid::new_v4().to_string(),
            name: request.key_name,
            private_key: private_key_pem,
        };
        self.issuers.write_key(&key).await?;

        let issuer = self
            .create_issuer(&der, Some(key.id.clone()), request.issuer_name)
            .await?;

        info!("Generated root issuer {} ({})", issuer.id, request.common_name);
        Ok(IssuerResponse::from(&issuer))
    }

    pub async fn generate_intermediate_csr(
        &self,
        request: IntermediateCsrRequest,
    ) -> Result<IntermediateCsrResponse> {
        if request.common_name.trim().is_empty() {
            return Err(PkiError::InvalidRequest("common_name is required".to_string()));
        }

        let key_pair = generate_key_pair(request.key_type)?;
        let key = KeyEntry {
            id: Uuid::new_v4().to_string(),
            name: request.key_name,
            private_key: key_pair.serialize_pem(),
        };

        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name = common_name_dn(&request.common_name);
        params.alg = request.key_type.algorithm();
        params.key_pair = Some(key_pair);
        let csr = RcgenCertificate::from_params(params)?.serialize_request_pem()?;

        self.issuers.write_key(&key).await?;
        info!("Generated intermediate CSR for {} with key {}", request.common_name, key.id);

        Ok(IntermediateCsrResponse { csr, key_id: key.id })
    }

    /// Signs a CA CSR with the referenced issuer. The result still has to be
    /// imported to become an issuer.
    pub async fn sign_intermediate(
        &self,
        issuer_ref: &str,
        csr_pem: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedCertificate> {
        let csr_der = pem_to_der(csr_pem, "CERTIFICATE REQUEST")?;
        let (issuer, signer) = self.load_signer(issuer_ref).await?;

        let mut csr = CertificateSigningRequest::from_der(&csr_der).map_err(|e| {
            PkiError::InvalidRequest(format!("Failed to parse CSR: {}", e))
        })?;
        let not_after = self.clamp_not_after(&issuer, ttl.unwrap_or(self.config.max_ttl))?;
        csr.params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        csr.params.key_usages = ca_key_usages();
        csr.params.serial_number = Some(random_serial());
        csr.params.not_before = to_offset(Utc::now() - chrono_duration(BACKDATE)?)?;
        csr.params.not_after = to_offset(not_after)?;

        let der = csr.serialize_der_with_signer(&signer)?;
        let details = self.certs.store_cert(&der).await?;

        info!("Issuer {} signed intermediate {}", issuer.id, details.serial);
        Ok(issued(&issuer, &details, None))
    }

    /// Imports CA certificates and PKCS#8 keys from a PEM bundle. Existing
    /// certificates and keys are matched and reported instead of duplicated.
    pub async fn import_bundle(&self, pem_bundle: &str) -> Result<ImportResponse> {
        let blocks = pem::parse_many(pem_bundle).map_err(|e| {
            PkiError::InvalidRequest(format!("Failed to parse PEM bundle: {}", e))
        })?;
        if blocks.is_empty() {
            return Err(PkiError::InvalidRequest("empty PEM bundle".to_string()));
        }

        let mut response = ImportResponse {
            imported_issuers: vec![],
            imported_keys: vec![],
            existing_issuers: vec![],
            existing_keys: vec![],
        };

        let mut known_keys: Vec<(KeyId, Vec<u8>)> = Vec::new();
        for key in self.issuers.list_keys().await? {
            match load_key_pair(&key.private_key) {
                Ok(pair) => known_keys.push((key.id.clone(), pair.public_key_raw().to_vec())),
                Err(e) => warn!("Stored key {} is unreadable: {}", key.id, e),
            }
        }

        let mut certs = Vec::new();
        for block in &blocks {
            match block.tag() {
                CERTIFICATE_PEM_TAG => certs.push(block.contents().to_vec()),
                PRIVATE_KEY_PEM_TAG => {
                    let key_pem = der_to_pem(PRIVATE_KEY_PEM_TAG, block.contents());
                    let pair = load_key_pair(&key_pem)?;
                    let public = pair.public_key_raw().to_vec();
                    if let Some((id, _)) = known_keys.iter().find(|(_, pk)| *pk == public) {
                        response.existing_keys.push(id.clone());
                        continue;
                    }
                    let key = KeyEntry {
                        id: Uuid::new_v4().to_string(),
                        name: String::new(),
                        private_key: key_pem,
                    };
                    self.issuers.write_key(&key).await?;
                    known_keys.push((key.id.clone(), public));
                    response.imported_keys.push(key.id);
                }
                other => {
                    return Err(PkiError::InvalidRequest(format!(
                        "unsupported PEM block in bundle: {}",
                        other
                    )))
                }
            }
        }

        let existing = self.issuers.list_issuers().await?;
        for der in certs {
            let details = CertDetails::from_der(&der)?;
            if !details.is_ca {
                return Err(PkiError::InvalidRequest(format!(
                    "refusing to import non-CA certificate {}",
                    details.serial
                )));
            }

            let already = existing.iter().find(|issuer| {
                issuer
                    .details()
                    .map(|d| d.der == details.der)
                    .unwrap_or(false)
            });
            if let Some(issuer) = already {
                response.existing_issuers.push(issuer.id.clone());
                continue;
            }

            let key_id = known_keys
                .iter()
                .find(|(_, pk)| *pk == details.public_key)
                .map(|(id, _)| id.clone());
            let issuer = self.create_issuer(&der, key_id, String::new()).await?;
            response.imported_issuers.push(issuer.id);
        }

        self.issuers.rebuild_chains().await?;

        info!(
            "Imported {} issuers and {} keys ({} issuers already present)",
            response.imported_issuers.len(),
            response.imported_keys.len(),
            response.existing_issuers.len()
        );
        Ok(response)
    }

    pub async fn issue_leaf(&self, request: IssueRequest) -> Result<IssuedCertificate> {
        if request.common_name.trim().is_empty() {
            return Err(PkiError::InvalidRequest("common_name is required".to_string()));
        }
        let issuer_ref = if request.issuer_ref.is_empty() {
            crate::pki::issuer::DEFAULT_REF
        } else {
            request.issuer_ref.as_str()
        };
        let (issuer, signer) = self.load_signer(issuer_ref).await?;

        let ttl = self.leaf_ttl(request.ttl)?;
        let not_after = self.clamp_not_after(&issuer, ttl)?;

        let key_pair = generate_key_pair(request.key_type)?;
        let private_key_pem = key_pair.serialize_pem();

        let mut sans: Vec<SanType> = Vec::new();
        if !request.alt_names.contains(&request.common_name)
            && request.common_name.parse::<IpAddr>().is_err()
        {
            sans.push(SanType::DnsName(request.common_name.clone()));
        }
        sans.extend(request.alt_names.iter().cloned().map(SanType::DnsName));
        sans.extend(request.ip_sans.iter().copied().map(SanType::IpAddress));

        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name = common_name_dn(&request.common_name);
        params.subject_alt_names = sans;
        params.is_ca = rcgen::IsCa::NoCa;
        params.key_usages = leaf_key_usages();
        params.extended_key_usages = leaf_extended_key_usages();
        params.alg = request.key_type.algorithm();
        params.serial_number = Some(random_serial());
        params.not_before = to_offset(Utc::now() - chrono_duration(BACKDATE)?)?;
        params.not_after = to_offset(not_after)?;
        params.key_pair = Some(key_pair);

        let certificate = RcgenCertificate::from_params(params)?;
        let der = certificate.serialize_der_with_signer(&signer)?;
        let details = self.certs.store_cert(&der).await?;

        info!("Issued certificate {} from issuer {}", details.serial, issuer.id);
        Ok(issued(&issuer, &details, Some(private_key_pem)))
    }

    /// Signs a leaf CSR with the referenced issuer, keeping its subject and,
    /// unless overridden, its SANs.
    pub async fn sign_csr(
        &self,
        issuer_ref: &str,
        csr_der: &[u8],
        options: SignOptions,
    ) -> Result<IssuedCertificate> {
        let (issuer, signer) = self.load_signer(issuer_ref).await?;

        let mut csr = CertificateSigningRequest::from_der(csr_der).map_err(|e| {
            PkiError::InvalidRequest(format!("Failed to parse CSR: {}", e))
        })?;

        let ttl = self.leaf_ttl(options.ttl)?;
        let not_after = self.clamp_not_after(&issuer, ttl)?;

        if options.dns_names.is_some() || options.ip_addresses.is_some() {
            let mut sans: Vec<SanType> = Vec::new();
            sans.extend(options.dns_names.unwrap_or_default().into_iter().map(SanType::DnsName));
            sans.extend(options.ip_addresses.unwrap_or_default().into_iter().map(SanType::IpAddress));
            csr.params.subject_alt_names = sans;
        }
        csr.params.is_ca = rcgen::IsCa::NoCa;
        csr.params.key_usages = leaf_key_usages();
        csr.params.extended_key_usages = leaf_extended_key_usages();
        csr.params.serial_number = Some(random_serial());
        csr.params.not_before = to_offset(Utc::now() - chrono_duration(BACKDATE)?)?;
        csr.params.not_after = to_offset(not_after)?;

        let der = csr.serialize_der_with_signer(&signer)?;
        let details = self.certs.store_cert(&der).await?;

        info!("Signed CSR as certificate {} from issuer {}", details.serial, issuer.id);
        Ok(issued(&issuer, &details, None))
    }

    async fn ensure_issuer_name_free(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        if name == crate::pki::issuer::DEFAULT_REF {
            return Err(PkiError::InvalidRequest(
                "issuer name 'default' is reserved".to_string(),
            ));
        }
        let taken = self
            .issuers
            .list_issuers()
            .await?
            .iter()
            .any(|issuer| issuer.name == name);
        if taken {
            return Err(PkiError::InvalidRequest(format!(
                "issuer name {} already in use",
                name
            )));
        }
        Ok(())
    }

    async fn create_issuer(
        &self,
        der: &[u8],
        key_id: Option<KeyId>,
        name: String,
    ) -> Result<IssuerEntry> {
        let details = self.certs.store_cert(der).await?;
        let pem = details.to_pem();
        let issuer = IssuerEntry {
            id: Uuid::new_v4().to_string(),
            name,
            key_id,
            certificate: pem.clone(),
            ca_chain: vec![pem],
            serial_number: details.serial.clone(),
            leaf_not_after_behavior: LeafNotAfterBehavior::default(),
            usage: default_usage(),
            revoked: false,
            revocation_time: None,
        };
        self.issuers.write_issuer(&issuer).await?;

        if self.issuers.issuer_defaults().await?.default_issuer_id.is_none() && issuer.key_id.is_some() {
            self.issuers.set_default_issuer(&issuer.id).await?;
        }

        self.issuers.rebuild_chains().await?;
        self.issuers.fetch_issuer_required(&issuer.id).await
    }

    async fn load_signer(&self, issuer_ref: &str) -> Result<(IssuerEntry, RcgenCertificate)> {
        let id = self.issuers.resolve_issuer_ref(issuer_ref).await?;
        let issuer = self.issuers.fetch_issuer_required(&id).await?;
        if !issuer.can_issue() {
            return Err(PkiError::InvalidRequest(format!(
                "issuer {} cannot issue certificates",
                issuer.id
            )));
        }

        let key_id = issuer.key_id.as_deref().ok_or_else(|| {
            PkiError::InvalidRequest(format!("issuer {} has no key", issuer.id))
        })?;
        let key = self
            .issuers
            .fetch_key(key_id)
            .await?
            .ok_or_else(|| PkiError::NotFound(format!("key {}", key_id)))?;

        let key_pair = load_key_pair(&key.private_key)?;
        let alg = key_pair.algorithm();
        let details = issuer.details()?;
        let mut params = CertificateParams::from_ca_cert_der(&details.der, key_pair)?;
        params.alg = alg;
        let signer = RcgenCertificate::from_params(params)?;

        Ok((issuer, signer))
    }

    fn leaf_ttl(&self, requested: Option<Duration>) -> Result<Duration> {
        let ttl = requested.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() || ttl > self.config.max_ttl {
            return Err(PkiError::InvalidRequest(format!(
                "ttl {} exceeds the maximum of {}",
                humantime::format_duration(ttl),
                humantime::format_duration(self.config.max_ttl)
            )));
        }
        Ok(ttl)
    }

    fn clamp_not_after(&self, issuer: &IssuerEntry, ttl: Duration) -> Result<DateTime<Utc>> {
        let requested = Utc::now() + chrono_duration(ttl)?;
        let issuer_not_after = issuer.details()?.not_after;
        if requested <= issuer_not_after {
            return Ok(requested);
        }
        match issuer.leaf_not_after_behavior {
            LeafNotAfterBehavior::Err => Err(PkiError::InvalidRequest(format!(
                "requested expiry {} is beyond issuer {} expiry {}",
                requested, issuer.id, issuer_not_after
            ))),
            LeafNotAfterBehavior::Truncate => Ok(issuer_not_after),
            LeafNotAfterBehavior::Permit => Ok(requested),
        }
    }
}

fn issued(issuer: &IssuerEntry, details: &CertDetails, private_key: Option<String>) -> IssuedCertificate {
    let ca_chain = if issuer.ca_chain.is_empty() {
        vec![issuer.certificate.clone()]
    } else {
        issuer.ca_chain.clone()
    };
    IssuedCertificate {
        certificate: details.to_pem(),
        private_key,
        serial_number: details.serial.clone(),
        expiration: details.not_after,
        issuer_id: issuer.id.clone(),
        issuing_ca: issuer.certificate.clone(),
        ca_chain,
    }
}

fn common_name_dn(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn ca_key_usages() -> Vec<rcgen::KeyUsagePurpose> {
    vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
        rcgen::KeyUsagePurpose::DigitalSignature,
    ]
}

fn leaf_key_usages() -> Vec<rcgen::KeyUsagePurpose> {
    vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ]
}

fn leaf_extended_key_usages() -> Vec<rcgen::ExtendedKeyUsagePurpose> {
    vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ]
}

/// 20 random octets with the top bit clear and a non-zero first octet, so
/// the INTEGER is positive and minimally encoded.
fn random_serial() -> rcgen::SerialNumber {
    let mut bytes = vec![0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    rcgen::SerialNumber::from(bytes)
}

fn to_offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| PkiError::InvalidRequest(format!("timestamp out of range: {}", e)))
}

pub(crate) fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| PkiError::InvalidRequest(format!("duration out of range: {}", e)))
}
