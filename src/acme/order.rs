//! Orders, authorizations and challenges, stored under their account.

use crate::acme::identifier::AcmeIdentifier;
use crate::error::{AcmeErrorKind, PkiError, Result};
use crate::pki::IssuerId;
use crate::storage::{get_json, put_json, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeOrder {
    pub id: String,
    pub account_id: String,
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<AcmeIdentifier>,
    pub authorization_ids: Vec<String>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub certificate_serial_number: Option<String>,
    #[serde(default)]
    pub certificate_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issuer_id: Option<IssuerId>,
}

impl AcmeOrder {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeAuthorization {
    pub id: String,
    pub account_id: String,
    /// Identifier without any wildcard label.
    pub identifier: AcmeIdentifier,
    pub wildcard: bool,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<AcmeChallenge>,
}

impl AcmeAuthorization {
    pub fn challenge_mut(&mut self, kind: ChallengeType) -> Option<&mut AcmeChallenge> {
        self.challenges.iter_mut().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "http-01" => Ok(ChallengeType::Http01),
            "dns-01" => Ok(ChallengeType::Dns01),
            other => Err(PkiError::acme(
                AcmeErrorKind::Malformed,
                format!("unknown challenge type {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeError {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeChallenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(default)]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ChallengeError>,
}

#[derive(Clone)]
pub struct OrderStore {
    storage: Arc<dyn Storage>,
}

impl OrderStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn order_prefix(account_id: &str) -> String {
        format!("acme/accounts/{}/orders/", account_id)
    }

    fn authz_prefix(account_id: &str) -> String {
        format!("acme/accounts/{}/authorizations/", account_id)
    }

    fn check_id(id: &str) -> Result<()> {
        if id.is_empty() || id.contains('/') {
            return Err(PkiError::acme(
                AcmeErrorKind::Malformed,
                format!("invalid identifier {}", id),
            ));
        }
        Ok(())
    }

    pub async fn write_order(&self, order: &AcmeOrder) -> Result<()> {
        put_json(
            self.storage.as_ref(),
            &format!("{}{}", Self::order_prefix(&order.account_id), order.id),
            order,
        )
        .await
    }

    /// Orders are only visible to the account that created them.
    pub async fn load_order(&self, account_id: &str, order_id: &str) -> Result<AcmeOrder> {
        Self::check_id(order_id)?;
        get_json(
            self.storage.as_ref(),
            &format!("{}{}", Self::order_prefix(account_id), order_id),
        )
        .await?
        .ok_or_else(|| PkiError::NotFound(format!("order {}", order_id)))
    }

    pub async fn delete_order(&self, account_id: &str, order_id: &str) -> Result<()> {
        self.storage
            .delete(&format!("{}{}", Self::order_prefix(account_id), order_id))
            .await
    }

    pub async fn list_order_ids(&self, account_id: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(&Self::order_prefix(account_id))
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect())
    }

    pub async fn list_orders(&self, account_id: &str) -> Result<Vec<AcmeOrder>> {
        let mut orders = Vec::new();
        for id in self.list_order_ids(account_id).await? {
            let order: Option<AcmeOrder> = get_json(
                self.storage.as_ref(),
                &format!("{}{}", Self::order_prefix(account_id), id),
            )
            .await?;
            orders.extend(order);
        }
        Ok(orders)
    }

    pub async fn write_authorization(&self, authz: &AcmeAuthorization) -> Result<()> {
        put_json(
            self.storage.as_ref(),
            &format!("{}{}", Self::authz_prefix(&authz.account_id), authz.id),
            authz,
        )
        .await
    }

    pub async fn load_authorization(
        &self,
        account_id: &str,
        authz_id: &str,
    ) -> Result<AcmeAuthorization> {
        Self::check_id(authz_id)?;
        get_json(
            self.storage.as_ref(),
            &format!("{}{}", Self::authz_prefix(account_id), authz_id),
        )
        .await?
        .ok_or_else(|| PkiError::NotFound(format!("authorization {}", authz_id)))
    }

    pub async fn delete_authorization(&self, account_id: &str, authz_id: &str) -> Result<()> {
        self.storage
            .delete(&format!("{}{}", Self::authz_prefix(account_id), authz_id))
            .await
    }
}
