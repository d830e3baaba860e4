use crate::error::{PkiError, Result};
use crate::pki::certutil::{is_signed_by, CertDetails};
use crate::storage::{get_json, put_json, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub type IssuerId = String;
pub type KeyId = String;

pub const DEFAULT_REF: &str = "default";

const ISSUER_PREFIX: &str = "issuer/";
const KEY_PREFIX: &str = "key/";
const ISSUERS_CONFIG: &str = "config/issuers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeafNotAfterBehavior {
    Err,
    #[default]
    Truncate,
    Permit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuerUsage {
    ReadOnly,
    IssuingCertificates,
    CrlSigning,
}

pub fn default_usage() -> Vec<IssuerUsage> {
    vec![
        IssuerUsage::ReadOnly,
        IssuerUsage::IssuingCertificates,
        IssuerUsage::CrlSigning,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerEntry {
    pub id: IssuerId,
    #[serde(default)]
    pub name: String,
    pub key_id: Option<KeyId>,
    /// PEM of the issuer certificate.
    pub certificate: String,
    /// PEM chain starting with this issuer and walking up to its root.
    #[serde(default)]
    pub ca_chain: Vec<String>,
    pub serial_number: String,
    #[serde(default)]
    pub leaf_not_after_behavior: LeafNotAfterBehavior,
    #[serde(default = "default_usage")]
    pub usage: Vec<IssuerUsage>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub revocation_time: Option<DateTime<Utc>>,
}

impl IssuerEntry {
    pub fn details(&self) -> Result<CertDetails> {
        CertDetails::from_pem(&self.certificate)
    }

    pub fn has_usage(&self, usage: IssuerUsage) -> bool {
        self.usage.contains(&usage)
    }

    /// Revoked issuers still sign CRLs; they only stop issuing.
    pub fn can_sign_crls(&self) -> bool {
        self.key_id.is_some() && self.has_usage(IssuerUsage::CrlSigning)
    }

    pub fn can_issue(&self) -> bool {
        self.key_id.is_some() && !self.revoked && self.has_usage(IssuerUsage::IssuingCertificates)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: KeyId,
    #[serde(default)]
    pub name: String,
    /// PKCS#8 PEM.
    pub private_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuerDefaults {
    pub default_issuer_id: Option<IssuerId>,
}

/// Storage accessor for issuers, their keys and the mount's default issuer.
#[derive(Clone)]
pub struct IssuerStore {
    storage: Arc<dyn Storage>,
}

impl IssuerStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn fetch_issuer(&self, id: &str) -> Result<Option<IssuerEntry>> {
        get_json(self.storage.as_ref(), &format!("{}{}", ISSUER_PREFIX, id)).await
    }

    pub async fn fetch_issuer_required(&self, id: &str) -> Result<IssuerEntry> {
        self.fetch_issuer(id)
            .await?
            .ok_or_else(|| PkiError::NotFound(format!("issuer {}", id)))
    }

    pub async fn write_issuer(&self, issuer: &IssuerEntry) -> Result<()> {
        put_json(self.storage.as_ref(), &format!("{}{}", ISSUER_PREFIX, issuer.id), issuer).await
    }

    pub async fn list_issuer_ids(&self) -> Result<Vec<IssuerId>> {
        let mut ids: Vec<IssuerId> = self
            .storage
            .list(ISSUER_PREFIX)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn list_issuers(&self) -> Result<Vec<IssuerEntry>> {
        let mut issuers = Vec::new();
        for id in self.list_issuer_ids().await? {
            if let Some(issuer) = self.fetch_issuer(&id).await? {
                issuers.push(issuer);
            }
        }
        Ok(issuers)
    }

    pub async fn fetch_key(&self, id: &str) -> Result<Option<KeyEntry>> {
        get_json(self.storage.as_ref(), &format!("{}{}", KEY_PREFIX, id)).await
    }

    pub async fn write_key(&self, key: &KeyEntry) -> Result<()> {
        put_json(self.storage.as_ref(), &format!("{}{}", KEY_PREFIX, key.id), key).await
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyEntry>> {
        let mut keys = Vec::new();
        for id in self.storage.list(KEY_PREFIX).await? {
            if id.ends_with('/') {
                continue;
            }
            if let Some(key) = self.fetch_key(&id).await? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    pub async fn issuer_defaults(&self) -> Result<IssuerDefaults> {
        Ok(get_json(self.storage.as_ref(), ISSUERS_CONFIG)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_default_issuer(&self, issuer_ref: &str) -> Result<IssuerId> {
        let id = self.resolve_issuer_ref(issuer_ref).await?;
        let defaults = IssuerDefaults {
            default_issuer_id: Some(id.clone()),
        };
        put_json(self.storage.as_ref(), ISSUERS_CONFIG, &defaults).await?;
        info!("Default issuer set to {}", id);
        Ok(id)
    }

    /// Resolves `default`, an issuer id or an issuer name to an issuer id.
    pub async fn resolve_issuer_ref(&self, issuer_ref: &str) -> Result<IssuerId> {
        if issuer_ref.is_empty() || issuer_ref == DEFAULT_REF {
            return self
                .issuer_defaults()
                .await?
                .default_issuer_id
                .ok_or_else(|| PkiError::NotFound("no default issuer configured".to_string()));
        }

        if self.fetch_issuer(issuer_ref).await?.is_some() {
            return Ok(issuer_ref.to_string());
        }

        self.list_issuers()
            .await?
            .into_iter()
            .find(|issuer| !issuer.name.is_empty() && issuer.name == issuer_ref)
            .map(|issuer| issuer.id)
            .ok_or_else(|| PkiError::NotFound(format!("issuer {}", issuer_ref)))
    }

    /// Removes the issuer. Its key stays so the issuer can be re-imported.
    pub async fn delete_issuer(&self, issuer_ref: &str) -> Result<IssuerEntry> {
        let id = self.resolve_issuer_ref(issuer_ref).await?;
        let issuer = self.fetch_issuer_required(&id).await?;

        self.storage.delete(&format!("{}{}", ISSUER_PREFIX, id)).await?;

        let mut defaults = self.issuer_defaults().await?;
        if defaults.default_issuer_id.as_deref() == Some(id.as_str()) {
            defaults.default_issuer_id = None;
            put_json(self.storage.as_ref(), ISSUERS_CONFIG, &defaults).await?;
        }

        info!("Deleted issuer {} ({})", id, issuer.name);
        Ok(issuer)
    }

    /// Finds the issuer whose key produced the signature on `cert_der`.
    pub async fn find_signing_issuer(&self, cert_der: &[u8]) -> Result<Option<IssuerId>> {
        for issuer in self.list_issuers().await? {
            let details = match issuer.details() {
                Ok(details) => details,
                Err(e) => {
                    debug!("Skipping unparseable issuer {}: {}", issuer.id, e);
                    continue;
                }
            };
            if is_signed_by(cert_der, &details.der) {
                return Ok(Some(issuer.id));
            }
        }
        Ok(None)
    }

    /// Recomputes `ca_chain` for every issuer.
    pub async fn rebuild_chains(&self) -> Result<()> {
        let issuers = self.list_issuers().await?;
        for issuer in &issuers {
            let chain = build_chain(issuer, &issuers)?;
            if chain != issuer.ca_chain {
                let mut updated = issuer.clone();
                updated.ca_chain = chain;
                self.write_issuer(&updated).await?;
            }
        }
        Ok(())
    }
}

/// Walks from `issuer` up through its parents by signature. A visited set
/// stops the walk on cycles, so malformed input yields a truncated chain.
pub fn build_chain(issuer: &IssuerEntry, all: &[IssuerEntry]) -> Result<Vec<String>> {
    let parsed: Vec<(IssuerId, CertDetails)> = all
        .iter()
        .filter_map(|entry| entry.details().ok().map(|d| (entry.id.clone(), d)))
        .collect();

    let mut current = issuer.details()?;
    let mut chain = vec![current.to_pem()];
    let mut visited: HashSet<Vec<u8>> = HashSet::new();
    visited.insert(current.der.clone());

    loop {
        if current.self_issued && is_signed_by(&current.der, &current.der) {
            break;
        }

        let parent = parsed
            .iter()
            .map(|(_, details)| details)
            .find(|candidate| !visited.contains(&candidate.der) && is_signed_by(&current.der, &candidate.der));

        match parent {
            Some(parent) => {
                visited.insert(parent.der.clone());
                chain.push(parent.to_pem());
                current = parent.clone();
            }
            None => break,
        }
    }

    Ok(chain)
}
