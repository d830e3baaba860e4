use crate::error::{AcmeErrorKind, PkiError, Result};
use crate::storage::{get_json, put_json, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const ACCOUNT_PREFIX: &str = "acme/accounts/";
const THUMBPRINT_PREFIX: &str = "acme/account-thumbprints/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeAccount {
    pub key_id: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    pub jwk: Value,
    pub thumbprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ThumbprintEntry {
    key_id: String,
}

/// Accounts plus the thumbprint -> key id index.
#[derive(Clone)]
pub struct AccountStore {
    storage: Arc<dyn Storage>,
}

impl AccountStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn account_key(key_id: &str) -> String {
        format!("{}{}", ACCOUNT_PREFIX, key_id)
    }

    fn thumbprint_key(thumbprint: &str) -> String {
        format!("{}{}", THUMBPRINT_PREFIX, thumbprint)
    }

    /// Writes the thumbprint index entry and then the account record. A crash
    /// between the two leaves an index entry that lookups treat as absent.
    pub async fn create_account(
        &self,
        jwk: Value,
        thumbprint: String,
        contact: Vec<String>,
        terms_of_service_agreed: bool,
    ) -> Result<AcmeAccount> {
        let account = AcmeAccount {
            key_id: Uuid::new_v4().to_string(),
            status: AccountStatus::Valid,
            contact,
            terms_of_service_agreed,
            jwk,
            thumbprint,
            created_at: Utc::now(),
        };

        put_json(
            self.storage.as_ref(),
            &Self::thumbprint_key(&account.thumbprint),
            &ThumbprintEntry {
                key_id: account.key_id.clone(),
            },
        )
        .await?;
        put_json(
            self.storage.as_ref(),
            &Self::account_key(&account.key_id),
            &account,
        )
        .await?;

        info!("Created ACME account {}", account.key_id);
        Ok(account)
    }

    pub async fn load_account(&self, key_id: &str) -> Result<Option<AcmeAccount>> {
        if key_id.is_empty() || key_id.contains('/') {
            return Ok(None);
        }
        get_json(self.storage.as_ref(), &Self::account_key(key_id)).await
    }

    pub async fn load_account_required(&self, key_id: &str) -> Result<AcmeAccount> {
        self.load_account(key_id).await?.ok_or_else(|| {
            PkiError::acme(
                AcmeErrorKind::AccountDoesNotExist,
                format!("account {} does not exist", key_id),
            )
        })
    }

    /// Resolves a thumbprint to its account. An index entry whose account
    /// record is missing resolves to `None`.
    pub async fn load_account_by_key(&self, thumbprint: &str) -> Result<Option<AcmeAccount>> {
        let entry: Option<ThumbprintEntry> =
            get_json(self.storage.as_ref(), &Self::thumbprint_key(thumbprint)).await?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        let account = self.load_account(&entry.key_id).await?;
        if account.is_none() {
            warn!(
                "Thumbprint index points at missing account {}; treating as absent",
                entry.key_id
            );
        }
        Ok(account)
    }

    /// Full overwrite of the account record.
    pub async fn update_account(&self, account: &AcmeAccount) -> Result<()> {
        put_json(
            self.storage.as_ref(),
            &Self::account_key(&account.key_id),
            account,
        )
        .await
    }

    /// Moves the account to a new key. The new index entry is written first
    /// and the old one removed last.
    pub async fn rekey_account(
        &self,
        account: &AcmeAccount,
        jwk: Value,
        thumbprint: String,
    ) -> Result<AcmeAccount> {
        let mut updated = account.clone();
        updated.jwk = jwk;
        updated.thumbprint = thumbprint;

        put_json(
            self.storage.as_ref(),
            &Self::thumbprint_key(&updated.thumbprint),
            &ThumbprintEntry {
                key_id: updated.key_id.clone(),
            },
        )
        .await?;
        self.update_account(&updated).await?;
        self.storage
            .delete(&Self::thumbprint_key(&account.thumbprint))
            .await?;

        info!("Rolled over key for ACME account {}", updated.key_id);
        Ok(updated)
    }

    pub async fn list_account_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(ACCOUNT_PREFIX)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect())
    }
}

/// Contacts must be `mailto:` URIs with a non-empty address.
pub fn validate_contacts(contacts: &[String]) -> Result<Vec<String>> {
    contacts
        .iter()
        .map(|contact| {
            let address = contact.strip_prefix("mailto:").ok_or_else(|| {
                PkiError::acme(
                    AcmeErrorKind::InvalidContact,
                    format!("unsupported contact {}", contact),
                )
            })?;
            if address.is_empty() || !address.contains('@') || address.contains(',') {
                return Err(PkiError::acme(
                    AcmeErrorKind::InvalidContact,
                    format!("invalid email contact {}", contact),
                ));
            }
            Ok(contact.clone())
        })
        .collect()
}
