use crate::config::CrlConfig;
use crate::error::{PkiError, Result};
use crate::pki::ca::chrono_duration;
use crate::pki::certutil::{der_to_pem, timestamp_to_utc, CertDetails};
use crate::pki::issuer::{IssuerEntry, IssuerId, IssuerStore, KeyId};
use crate::pki::keys::RawSigner;
use crate::pki::revocation::{RevocationInfo, RevocationStore};
use crate::pki::serial::{serial_from_bytes, serial_to_bytes};
use crate::storage::{get_json, put_json, Storage};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use const_oid::ObjectIdentifier;
use der::asn1::{BitString, GeneralizedTime, OctetString, UtcTime};
use der::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::AuthorityKeyIdentifier;
use x509_cert::ext::Extension;
use x509_cert::time::Time;

pub type CrlId = String;

pub const CRL_PEM_TAG: &str = "X509 CRL";

pub const OID_CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
pub const OID_DELTA_CRL_INDICATOR: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.27");
pub const OID_AUTHORITY_KEY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.35");

const CRL_PREFIX: &str = "crls/";
const LOCAL_CRL_CONFIG: &str = "crls/config";
const DELTA_SUFFIX: &str = "-delta";

/// Bookkeeping for built CRLs. Complete and delta lists of one CRL id draw
/// from the same number sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalCrlConfig {
    #[serde(default)]
    pub issuer_to_crl: HashMap<IssuerId, CrlId>,
    #[serde(default)]
    pub key_to_crl: HashMap<KeyId, CrlId>,
    /// Next number to hand out per CRL id.
    #[serde(default)]
    pub crl_numbers: HashMap<CrlId, u64>,
    #[serde(default)]
    pub last_complete_numbers: HashMap<CrlId, u64>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delta_last_modified: Option<DateTime<Utc>>,
}

impl LocalCrlConfig {
    fn take_number(&mut self, crl_id: &str) -> u64 {
        let next = self.crl_numbers.entry(crl_id.to_string()).or_insert(1);
        let number = *next;
        *next += 1;
        number
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlKind {
    Complete,
    Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltCrl {
    pub crl_id: CrlId,
    pub number: u64,
    pub base_number: Option<u64>,
    pub entries: usize,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrlBuildReport {
    pub complete: Vec<BuiltCrl>,
    pub delta: Vec<BuiltCrl>,
    /// Serials left off because their issuer could not be resolved or the
    /// serial cannot be encoded as a CRL entry.
    pub omitted_serials: Vec<String>,
}

/// What a stored CRL says about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CrlSummary {
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub number: Option<u64>,
    pub base_number: Option<u64>,
    pub revoked: Vec<(String, DateTime<Utc>)>,
    pub extension_count: usize,
}

impl CrlSummary {
    pub fn contains(&self, serial: &str) -> bool {
        self.revoked.iter().any(|(s, _)| s == serial)
    }
}

struct IssuerGroup {
    crl_id: CrlId,
    key_id: KeyId,
    members: Vec<IssuerEntry>,
    own_serials: HashSet<String>,
}

impl IssuerGroup {
    fn member_ids(&self) -> HashSet<&str> {
        self.members.iter().map(|m| m.id.as_str()).collect()
    }

    fn wants(&self, record: &RevocationInfo, now: DateTime<Utc>) -> bool {
        let Some(issuer) = record.certificate_issuer.as_deref() else {
            return false;
        };
        self.member_ids().contains(issuer)
            && !self.own_serials.contains(&record.serial_number)
            && record.certificate_expiry > now
    }
}

struct PendingCrl {
    crl_id: CrlId,
    kind: CrlKind,
    der: Vec<u8>,
    summary: BuiltCrl,
}

pub struct CrlBuilder {
    storage: Arc<dyn Storage>,
    issuers: IssuerStore,
    revocations: Arc<RevocationStore>,
}

impl CrlBuilder {
    pub fn new(storage: Arc<dyn Storage>, issuers: IssuerStore, revocations: Arc<RevocationStore>) -> Self {
        Self {
            storage,
            issuers,
            revocations,
        }
    }

    pub async fn local_config(&self) -> Result<LocalCrlConfig> {
        Ok(get_json(self.storage.as_ref(), LOCAL_CRL_CONFIG)
            .await?
            .unwrap_or_default())
    }

    async fn save_local_config(&self, local: &LocalCrlConfig) -> Result<()> {
        put_json(self.storage.as_ref(), LOCAL_CRL_CONFIG, local).await
    }

    /// Builds complete CRLs for every issuer group and, when delta lists are
    /// active, an empty delta per group. Nothing is published until every
    /// group has been built; cancellation between groups discards the lot.
    pub async fn build_complete(
        &self,
        config: &CrlConfig,
        cancel: &CancellationToken,
    ) -> Result<CrlBuildReport> {
        let now = Utc::now();
        let mut local = self.local_config().await?;
        let issuers = self.issuers.list_issuers().await?;
        let default_id = self.issuers.issuer_defaults().await?.default_issuer_id;
        let groups = group_issuers(&issuers, &mut local);

        let wal_snapshot = self.revocations.delta_wal_serials().await?;
        let marker_snapshot = self.revocations.last_revoked_marker().await?;
        let records = self.revocations.list_records().await?;

        if groups.is_empty() {
            if records.is_empty() {
                debug!("No issuers and no revocations; nothing to build");
                return Ok(CrlBuildReport::default());
            }
            return Err(PkiError::CrlBuild(format!(
                "{} revoked certificates but no issuer can sign a CRL",
                records.len()
            )));
        }

        let mut omitted = omitted_serials(&records, &issuers, now);
        for serial in &omitted {
            warn!("Revoked certificate {} has no resolvable issuer; omitted from CRLs", serial);
        }

        let mut pending = Vec::new();
        for group in &groups {
            if cancel.is_cancelled() {
                info!("CRL build cancelled before group {}; discarding partial build", group.crl_id);
                return Err(PkiError::Cancelled);
            }

            let Some(signing_issuer) = pick_signer(group, default_id.as_deref()) else {
                warn!("No issuer in key group {} may sign CRLs; skipping", group.key_id);
                continue;
            };
            let signer = self.load_signer(signing_issuer).await?;
            let issuer_details = signing_issuer.details()?;

            let entries = if config.disable {
                vec![]
            } else {
                revoked_entries(records.iter().filter(|r| group.wants(r, now)), &mut omitted)
            };

            let this_update = now;
            let next_update = now + chrono_duration(config.expiry)?;
            let number = local.take_number(&group.crl_id);
            let entry_count = entries.len();
            let der = encode_crl(&signer, &issuer_details, number, None, this_update, next_update, entries)?;
            pending.push(PendingCrl {
                crl_id: group.crl_id.clone(),
                kind: CrlKind::Complete,
                der,
                summary: BuiltCrl {
                    crl_id: group.crl_id.clone(),
                    number,
                    base_number: None,
                    entries: entry_count,
                    this_update,
                    next_update,
                },
            });

            if config.delta_active() {
                let delta_number = local.take_number(&group.crl_id);
                let der = encode_crl(
                    &signer,
                    &issuer_details,
                    delta_number,
                    Some(number),
                    this_update,
                    next_update,
                    Vec::new(),
                )?;
                pending.push(PendingCrl {
                    crl_id: group.crl_id.clone(),
                    kind: CrlKind::Delta,
                    der,
                    summary: BuiltCrl {
                        crl_id: group.crl_id.clone(),
                        number: delta_number,
                        base_number: Some(number),
                        entries: 0,
                        this_update,
                        next_update,
                    },
                });
            }

            local
                .last_complete_numbers
                .insert(group.crl_id.clone(), number);
        }

        local.last_modified = Some(now);
        if config.delta_active() {
            local.delta_last_modified = Some(now);
        }
        self.save_local_config(&local).await?;

        let mut report = CrlBuildReport {
            omitted_serials: omitted,
            ..Default::default()
        };
        for crl in pending {
            self.publish(&crl).await?;
            match crl.kind {
                CrlKind::Complete => report.complete.push(crl.summary),
                CrlKind::Delta => report.delta.push(crl.summary),
            }
        }

        self.revocations.clear_delta_wal(&wal_snapshot).await?;
        if let Some(marker) = marker_snapshot {
            self.revocations.record_delta_build(&marker).await?;
        }

        info!(
            "Built {} complete CRLs ({} delta) at {}",
            report.complete.len(),
            report.delta.len(),
            now
        );
        Ok(report)
    }

    /// Builds delta CRLs holding every revocation recorded since the last
    /// complete build. Groups without a complete CRL are skipped.
    pub async fn build_delta(
        &self,
        config: &CrlConfig,
        cancel: &CancellationToken,
    ) -> Result<CrlBuildReport> {
        let now = Utc::now();
        let mut local = self.local_config().await?;
        let issuers = self.issuers.list_issuers().await?;
        let default_id = self.issuers.issuer_defaults().await?.default_issuer_id;

        let marker_snapshot = self.revocations.last_revoked_marker().await?;
        let mut records = Vec::new();
        for serial in self.revocations.delta_wal_serials().await? {
            if let Some(record) = self.revocations.fetch(&serial).await? {
                records.push(record);
            }
        }

        let mut scratch = local.clone();
        let groups = group_issuers(&issuers, &mut scratch);

        let mut omitted = Vec::new();
        let mut pending = Vec::new();
        for group in &groups {
            if cancel.is_cancelled() {
                return Err(PkiError::Cancelled);
            }
            let Some(base) = local.last_complete_numbers.get(&group.crl_id).copied() else {
                debug!("CRL {} has no complete list yet; skipping delta", group.crl_id);
                continue;
            };
            let Some(signing_issuer) = pick_signer(group, default_id.as_deref()) else {
                continue;
            };
            let signer = self.load_signer(signing_issuer).await?;
            let issuer_details = signing_issuer.details()?;

            let entries = if config.disable {
                vec![]
            } else {
                revoked_entries(records.iter().filter(|r| group.wants(r, now)), &mut omitted)
            };

            let number = local.take_number(&group.crl_id);
            let next_update = now + chrono_duration(config.expiry)?;
            let entry_count = entries.len();
            let der = encode_crl(&signer, &issuer_details, number, Some(base), now, next_update, entries)?;
            pending.push(PendingCrl {
                crl_id: group.crl_id.clone(),
                kind: CrlKind::Delta,
                der,
                summary: BuiltCrl {
                    crl_id: group.crl_id.clone(),
                    number,
                    base_number: Some(base),
                    entries: entry_count,
                    this_update: now,
                    next_update,
                },
            });
        }

        local.delta_last_modified = Some(now);
        self.save_local_config(&local).await?;

        let mut report = CrlBuildReport {
            omitted_serials: omitted,
            ..Default::default()
        };
        for crl in pending {
            self.publish(&crl).await?;
            report.delta.push(crl.summary);
        }
        if let Some(marker) = marker_snapshot {
            self.revocations.record_delta_build(&marker).await?;
        }

        info!("Built {} delta CRLs at {}", report.delta.len(), now);
        Ok(report)
    }

    async fn publish(&self, crl: &PendingCrl) -> Result<()> {
        self.storage
            .put(&crl_key(&crl.crl_id, crl.kind), Bytes::from(crl.der.clone()))
            .await
    }

    async fn load_signer(&self, issuer: &IssuerEntry) -> Result<RawSigner> {
        let key_id = issuer
            .key_id
            .as_deref()
            .ok_or_else(|| PkiError::CrlBuild(format!("issuer {} has no key", issuer.id)))?;
        let key = self
            .issuers
            .fetch_key(key_id)
            .await?
            .ok_or_else(|| PkiError::CrlBuild(format!("key {} for issuer {} is missing", key_id, issuer.id)))?;
        RawSigner::from_pem(&key.private_key)
    }

    pub async fn fetch_crl(&self, crl_id: &str, kind: CrlKind) -> Result<Option<Vec<u8>>> {
        Ok(self
            .storage
            .get(&crl_key(crl_id, kind))
            .await?
            .map(|b| b.to_vec()))
    }

    /// The CRL covering `issuer_id`, if one has been built.
    pub async fn fetch_issuer_crl(&self, issuer_id: &str, kind: CrlKind) -> Result<Option<Vec<u8>>> {
        let local = self.local_config().await?;
        match local.issuer_to_crl.get(issuer_id) {
            Some(crl_id) => self.fetch_crl(crl_id, kind).await,
            None => Ok(None),
        }
    }

    /// Summaries of every stored complete CRL, keyed by CRL id.
    pub async fn stored_complete_crls(&self) -> Result<HashMap<CrlId, CrlSummary>> {
        let local = self.local_config().await?;
        let crl_ids: HashSet<&CrlId> = local.issuer_to_crl.values().collect();
        let mut out = HashMap::new();
        for crl_id in crl_ids {
            if let Some(der) = self.fetch_crl(crl_id, CrlKind::Complete).await? {
                match inspect_crl(&der) {
                    Ok(summary) => {
                        out.insert(crl_id.clone(), summary);
                    }
                    Err(e) => warn!("Stored CRL {} is unreadable: {}", crl_id, e),
                }
            }
        }
        Ok(out)
    }
}

fn crl_key(crl_id: &str, kind: CrlKind) -> String {
    match kind {
        CrlKind::Complete => format!("{}{}", CRL_PREFIX, crl_id),
        CrlKind::Delta => format!("{}{}{}", CRL_PREFIX, crl_id, DELTA_SUFFIX),
    }
}

/// Groups keyed issuers by key. Each key keeps its CRL id across builds;
/// `issuer_to_crl` is rewritten from scratch so deleted issuers drop out.
fn group_issuers(issuers: &[IssuerEntry], local: &mut LocalCrlConfig) -> Vec<IssuerGroup> {
    let mut by_key: HashMap<KeyId, Vec<IssuerEntry>> = HashMap::new();
    for issuer in issuers {
        if let Some(key_id) = &issuer.key_id {
            by_key.entry(key_id.clone()).or_default().push(issuer.clone());
        }
    }

    local.issuer_to_crl.clear();
    let mut groups: Vec<IssuerGroup> = by_key
        .into_iter()
        .map(|(key_id, members)| {
            let crl_id = local
                .key_to_crl
                .entry(key_id.clone())
                .or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            for member in &members {
                local.issuer_to_crl.insert(member.id.clone(), crl_id.clone());
            }
            let own_serials = members.iter().map(|m| m.serial_number.clone()).collect();
            IssuerGroup {
                crl_id,
                key_id,
                members,
                own_serials,
            }
        })
        .collect();
    groups.sort_by(|a, b| a.crl_id.cmp(&b.crl_id));
    groups
}

/// The default issuer when it belongs to the group, else the CRL-capable
/// member with the latest expiry.
fn pick_signer<'a>(group: &'a IssuerGroup, default_id: Option<&str>) -> Option<&'a IssuerEntry> {
    let capable: Vec<&IssuerEntry> = group.members.iter().filter(|m| m.can_sign_crls()).collect();
    if let Some(default_id) = default_id {
        if let Some(default) = capable.iter().find(|m| m.id == default_id) {
            return Some(*default);
        }
    }
    capable
        .into_iter()
        .max_by_key(|m| m.details().map(|d| d.not_after).ok())
}

fn omitted_serials(records: &[RevocationInfo], issuers: &[IssuerEntry], now: DateTime<Utc>) -> Vec<String> {
    let keyed: HashSet<&str> = issuers
        .iter()
        .filter(|i| i.key_id.is_some())
        .map(|i| i.id.as_str())
        .collect();
    records
        .iter()
        .filter(|r| r.certificate_expiry > now)
        .filter(|r| match r.certificate_issuer.as_deref() {
            Some(id) => !keyed.contains(id),
            None => true,
        })
        .map(|r| r.serial_number.clone())
        .collect()
}

/// Encodes the entries of one list, sorted by serial. A record whose serial
/// or revocation time cannot be encoded is left off and reported in
/// `omitted` so the rest of the list still gets published.
fn revoked_entries<'a>(
    records: impl Iterator<Item = &'a RevocationInfo>,
    omitted: &mut Vec<String>,
) -> Vec<RevokedCert> {
    let mut sorted: Vec<&RevocationInfo> = records.collect();
    sorted.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));

    let mut revoked = Vec::with_capacity(sorted.len());
    for record in sorted {
        match revoked_entry(record) {
            Ok(entry) => revoked.push(entry),
            Err(e) => {
                warn!(
                    serial = %record.serial_number,
                    "Revoked certificate cannot be encoded as a CRL entry; omitted: {}", e
                );
                if !omitted.contains(&record.serial_number) {
                    omitted.push(record.serial_number.clone());
                }
            }
        }
    }
    revoked
}

fn revoked_entry(record: &RevocationInfo) -> Result<RevokedCert> {
    Ok(RevokedCert {
        serial_number: x509_cert::serial_number::SerialNumber::new(&serial_to_bytes(
            &record.serial_number,
        )?)?,
        revocation_date: asn1_time(record.revocation_time)?,
        crl_entry_extensions: None,
    })
}

fn asn1_time(at: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(at.timestamp())
        .map_err(|_| PkiError::CrlBuild(format!("time before epoch: {}", at)))?;
    let since_epoch = std::time::Duration::from_secs(secs);
    if at.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_unix_duration(since_epoch)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(since_epoch)?))
    }
}

fn encode_crl(
    signer: &RawSigner,
    issuer: &CertDetails,
    number: u64,
    base_number: Option<u64>,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    revoked: Vec<RevokedCert>,
) -> Result<Vec<u8>> {
    let issuer_cert = x509_cert::Certificate::from_der(&issuer.der)?;
    let algorithm = signer.algorithm_identifier()?;

    let mut extensions = Vec::new();
    if let Some(key_id) = &issuer.subject_key_id {
        let aki = AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(key_id.clone())?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };
        extensions.push(Extension {
            extn_id: OID_AUTHORITY_KEY_IDENTIFIER,
            critical: false,
            extn_value: OctetString::new(aki.to_der()?)?,
        });
    }
    extensions.push(Extension {
        extn_id: OID_CRL_NUMBER,
        critical: false,
        extn_value: OctetString::new(number.to_der()?)?,
    });
    if let Some(base) = base_number {
        extensions.push(Extension {
            extn_id: OID_DELTA_CRL_INDICATOR,
            critical: true,
            extn_value: OctetString::new(base.to_der()?)?,
        });
    }

    let tbs = TbsCertList {
        version: x509_cert::Version::V2,
        signature: algorithm.clone(),
        issuer: issuer_cert.tbs_certificate.subject,
        this_update: asn1_time(this_update)?,
        next_update: Some(asn1_time(next_update)?),
        revoked_certificates: if revoked.is_empty() { None } else { Some(revoked) },
        crl_extensions: Some(extensions),
    };

    let tbs_der = tbs.to_der()?;
    let signature = signer.sign(&tbs_der)?;
    let crl = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(&signature)?,
    };
    Ok(crl.to_der()?)
}

pub fn crl_to_pem(der: &[u8]) -> String {
    der_to_pem(CRL_PEM_TAG, der)
}

/// Parses a DER CRL back into the fields the engine and its callers check.
pub fn inspect_crl(der: &[u8]) -> Result<CrlSummary> {
    let (_, crl) = x509_parser::parse_x509_crl(der).map_err(|e| PkiError::InvalidCertificate {
        reason: format!("Failed to parse CRL: {}", e),
    })?;

    let mut number = None;
    let mut base_number = None;
    for ext in crl.extensions() {
        let oid = ext.oid.to_id_string();
        if oid == OID_CRL_NUMBER.to_string() {
            number = u64::from_der(ext.value).ok();
        } else if oid == OID_DELTA_CRL_INDICATOR.to_string() {
            base_number = u64::from_der(ext.value).ok();
        }
    }

    let mut revoked = Vec::new();
    for entry in crl.iter_revoked_certificates() {
        revoked.push((
            serial_from_bytes(entry.raw_serial()),
            timestamp_to_utc(entry.revocation_date.timestamp())?,
        ));
    }

    Ok(CrlSummary {
        this_update: timestamp_to_utc(crl.last_update().timestamp())?,
        next_update: match crl.next_update() {
            Some(t) => Some(timestamp_to_utc(t.timestamp())?),
            None => None,
        },
        number,
        base_number,
        revoked,
        extension_count: crl.extensions().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IssuanceConfig;
    use crate::pki::ca::{CertificateAuthority, GenerateRootRequest, IssueRequest};
    use crate::pki::cert_store::CertStore;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    struct Fixture {
        ca: CertificateAuthority,
        issuers: IssuerStore,
        revocations: Arc<RevocationStore>,
        builder: CrlBuilder,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let issuers = IssuerStore::new(storage.clone());
        let certs = CertStore::new(storage.clone());
        let ca = CertificateAuthority::new(issuers.clone(), certs.clone(), IssuanceConfig::default());
        let revocations = Arc::new(RevocationStore::new(storage.clone(), issuers.clone(), certs));
        let builder = CrlBuilder::new(storage, issuers.clone(), revocations.clone());
        Fixture {
            ca,
            issuers,
            revocations,
            builder,
        }
    }

    async fn root(f: &Fixture, name: &str) -> String {
        f.ca.generate_root(GenerateRootRequest {
            common_name: name.to_string(),
            issuer_name: name.to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .issuer_id
    }

    async fn leaf(f: &Fixture, issuer: &str, cn: &str) -> String {
        f.ca.issue_leaf(IssueRequest {
            issuer_ref: issuer.to_string(),
            common_name: cn.to_string(),
            ttl: Some(Duration::from_secs(3600)),
            ..Default::default()
        })
        .await
        .unwrap()
        .serial_number
    }

    #[tokio::test]
    async fn test_complete_crl_lists_revoked_leaf() {
        let f = fixture();
        let root_id = root(&f, "root").await;
        let serial = leaf(&f, &root_id, "a.example.com").await;
        let revoked = f.revocations.revoke_serial(&serial, false).await.unwrap();

        let report = f
            .builder
            .build_complete(&CrlConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.complete.len(), 1);
        assert!(report.delta.is_empty());

        let der = f
            .builder
            .fetch_issuer_crl(&root_id, CrlKind::Complete)
            .await
            .unwrap()
            .unwrap();
        let summary = inspect_crl(&der).unwrap();
        assert_eq!(summary.revoked.len(), 1);
        assert_eq!(summary.revoked[0].0, serial);
        assert_eq!(
            summary.revoked[0].1.timestamp(),
            revoked.revocation_time.unwrap().timestamp()
        );
        assert_eq!(summary.number, Some(1));
    }

    #[tokio::test]
    async fn test_unencodable_serial_is_omitted_not_fatal() {
        let f = fixture();
        let root_id = root(&f, "root").await;
        let serial = leaf(&f, &root_id, "ok.example.com").await;
        f.revocations.revoke_serial(&serial, false).await.unwrap();

        let oversized = vec!["ff"; 20].join("-");
        f.revocations
            .write(&RevocationInfo {
                serial_number: oversized.clone(),
                certificate_der: Vec::new(),
                revocation_time: Utc::now(),
                certificate_expiry: Utc::now() + chrono::Duration::hours(1),
                certificate_issuer: Some(root_id.clone()),
            })
            .await
            .unwrap();

        let report = f
            .builder
            .build_complete(&CrlConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.omitted_serials, vec![oversized]);
        assert_eq!(report.complete[0].entries, 1);

        let der = f
            .builder
            .fetch_issuer_crl(&root_id, CrlKind::Complete)
            .await
            .unwrap()
            .unwrap();
        let summary = inspect_crl(&der).unwrap();
        assert_eq!(summary.revoked.len(), 1);
        assert!(summary.contains(&serial));
    }

    #[tokio::test]
    async fn test_crl_numbers_increase() {
        let f = fixture();
        root(&f, "root").await;
        let config = CrlConfig::default();
        let token = CancellationToken::new();

        let first = f.builder.build_complete(&config, &token).await.unwrap();
        let second = f.builder.build_complete(&config, &token).await.unwrap();
        assert!(second.complete[0].number > first.complete[0].number);
    }

    #[tokio::test]
    async fn test_full_build_with_delta_emits_empty_delta() {
        let f = fixture();
        let root_id = root(&f, "root").await;
        let serial = leaf(&f, &root_id, "b.example.com").await;
        f.revocations.revoke_serial(&serial, true).await.unwrap();

        let config = CrlConfig {
            auto_rebuild: true,
            enable_delta: true,
            ..Default::default()
        };
        f.builder
            .build_complete(&config, &CancellationToken::new())
            .await
            .unwrap();

        let complete = inspect_crl(
            &f.builder.fetch_issuer_crl(&root_id, CrlKind::Complete).await.unwrap().unwrap(),
        )
        .unwrap();
        let delta = inspect_crl(
            &f.builder.fetch_issuer_crl(&root_id, CrlKind::Delta).await.unwrap().unwrap(),
        )
        .unwrap();

        assert!(complete.contains(&serial));
        assert!(delta.revoked.is_empty());
        assert_eq!(delta.extension_count, complete.extension_count + 1);
        assert_eq!(delta.base_number, complete.number);
        assert!(f.revocations.delta_wal_serials().await.unwrap().is_empty());
        assert!(!f.revocations.delta_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_delta_build_carries_new_revocations() {
        let f = fixture();
        let root_id = root(&f, "root").await;
        let config = CrlConfig {
            auto_rebuild: true,
            enable_delta: true,
            ..Default::default()
        };
        let token = CancellationToken::new();
        f.builder.build_complete(&config, &token).await.unwrap();

        let serial = leaf(&f, &root_id, "c.example.com").await;
        f.revocations.revoke_serial(&serial, true).await.unwrap();
        let report = f.builder.build_delta(&config, &token).await.unwrap();
        assert_eq!(report.delta.len(), 1);
        assert_eq!(report.delta[0].entries, 1);

        let delta = inspect_crl(
            &f.builder.fetch_issuer_crl(&root_id, CrlKind::Delta).await.unwrap().unwrap(),
        )
        .unwrap();
        assert!(delta.contains(&serial));
        assert_eq!(delta.base_number, Some(1));
    }

    #[tokio::test]
    async fn test_disabled_crl_is_empty_but_signed() {
        let f = fixture();
        let root_id = root(&f, "root").await;
        let serial = leaf(&f, &root_id, "d.example.com").await;
        f.revocations.revoke_serial(&serial, false).await.unwrap();

        let config = CrlConfig {
            disable: true,
            ..Default::default()
        };
        f.builder
            .build_complete(&config, &CancellationToken::new())
            .await
            .unwrap();
        let summary = inspect_crl(
            &f.builder.fetch_issuer_crl(&root_id, CrlKind::Complete).await.unwrap().unwrap(),
        )
        .unwrap();
        assert!(summary.revoked.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_build_publishes_nothing() {
        let f = fixture();
        let root_id = root(&f, "root").await;
        let token = CancellationToken::new();
        token.cancel();

        let err = f
            .builder
            .build_complete(&CrlConfig::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PkiError::Cancelled));
        assert!(f
            .builder
            .fetch_issuer_crl(&root_id, CrlKind::Complete)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deleted_issuer_serial_is_omitted() {
        let f = fixture();
        let a = root(&f, "a").await;
        let b = root(&f, "b").await;
        let serial = leaf(&f, &a, "e.example.com").await;
        f.revocations.revoke_serial(&serial, false).await.unwrap();
        f.issuers.delete_issuer(&a).await.unwrap();

        let report = f
            .builder
            .build_complete(&CrlConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.omitted_serials, vec![serial.clone()]);

        let summary = inspect_crl(
            &f.builder.fetch_issuer_crl(&b, CrlKind::Complete).await.unwrap().unwrap(),
        )
        .unwrap();
        assert!(!summary.contains(&serial));
    }

    #[tokio::test]
    async fn test_no_issuers_with_revocations_fails() {
        let f = fixture();
        let a = root(&f, "a").await;
        let serial = leaf(&f, &a, "f.example.com").await;
        f.revocations.revoke_serial(&serial, false).await.unwrap();
        f.issuers.delete_issuer(&a).await.unwrap();

        let err = f
            .builder
            .build_complete(&CrlConfig::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PkiError::CrlBuild(_)));
    }
}
