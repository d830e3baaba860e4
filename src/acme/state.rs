//! RFC 8555 request handling: authentication of JWS requests and the
//! account, order, authorization and finalize flows.

use crate::acme::account::{validate_contacts, AccountStatus, AccountStore, AcmeAccount};
use crate::acme::challenge::{key_authorization, new_token, ChallengeValidator};
use crate::acme::identifier::{
    identifier_sets, sort_dedup, validate_raw, AcmeIdentifier, IdentifierType, RawIdentifier,
};
use crate::acme::jws::{decode_b64, AccountKey, JwsRequest, ProtectedHeader};
use crate::acme::nonce::NonceManager;
use crate::acme::order::{
    AcmeAuthorization, AcmeChallenge, AcmeOrder, AuthorizationStatus, ChallengeError,
    ChallengeStatus, ChallengeType, OrderStatus, OrderStore,
};
use crate::config::AcmeConfig;
use crate::error::{AcmeErrorKind, PkiError, Result};
use crate::pki::ca::chrono_duration;
use crate::pki::certutil::{der_to_pem, CertDetails, CERTIFICATE_PEM_TAG};
use crate::pki::{CertStore, CertificateAuthority, IssuerStore, SignOptions};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,
    pub key_change: String,
    pub meta: DirectoryMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub caa_identities: Vec<String>,
    pub external_account_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub status: AccountStatus,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    pub orders: String,
}

#[derive(Debug, Clone)]
pub struct AccountOutcome {
    /// True when this request created the account (HTTP 201).
    pub created: bool,
    pub location: String,
    pub account: AccountResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<AcmeIdentifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub location: String,
    pub order: OrderResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ChallengeError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub identifier: AcmeIdentifier,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<ChallengeResponse>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub wildcard: bool,
}

/// A revoke-cert request that passed authorization. The caller performs
/// the revocation itself.
#[derive(Debug, Clone)]
pub struct RevocationAuthorization {
    pub serial_number: String,
    pub certificate_der: Vec<u8>,
    pub reason: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeTidyStatus {
    pub orders_deleted: usize,
    pub authorizations_deleted: usize,
    pub nonces_deleted: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAccountPayload {
    #[serde(default)]
    contact: Vec<String>,
    #[serde(default)]
    terms_of_service_agreed: bool,
    #[serde(default)]
    only_return_existing: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateAccountPayload {
    #[serde(default)]
    contact: Option<Vec<String>>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderPayload {
    identifiers: Vec<RawIdentifier>,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    not_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UpdateAuthorizationPayload {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinalizePayload {
    csr: String,
}

#[derive(Debug, Deserialize)]
struct RevokePayload {
    certificate: String,
    #[serde(default)]
    reason: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyChangePayload {
    account: String,
    old_key: Value,
}

/// Who signed a request.
#[derive(Debug, Clone)]
pub enum Requester {
    Account {
        account: AcmeAccount,
        key: AccountKey,
    },
    Key {
        key: AccountKey,
        thumbprint: String,
        jwk: Value,
    },
}

/// Per-record async locks for read-modify-write cycles on orders and
/// authorizations. An entry lives only while some request holds it.
#[derive(Default)]
struct RecordLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecordLocks {
    async fn run<T, F>(&self, key: String, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock().await;
        let result = future.await;
        drop(guard);
        drop(lock);

        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    KidOnly,
    JwkOnly,
    Either,
}

pub struct AcmeState {
    config: AcmeConfig,
    nonces: NonceManager,
    accounts: AccountStore,
    orders: OrderStore,
    ca: CertificateAuthority,
    issuers: IssuerStore,
    certs: CertStore,
    validator: Arc<dyn ChallengeValidator>,
    record_locks: RecordLocks,
}

impl AcmeState {
    pub fn new(
        config: AcmeConfig,
        accounts: AccountStore,
        orders: OrderStore,
        ca: CertificateAuthority,
        issuers: IssuerStore,
        certs: CertStore,
        validator: Arc<dyn ChallengeValidator>,
    ) -> Self {
        Self {
            nonces: NonceManager::new(config.nonce_lifetime),
            config,
            accounts,
            orders,
            ca,
            issuers,
            certs,
            validator,
            record_locks: RecordLocks::default(),
        }
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub fn account_url(&self, account_id: &str) -> String {
        self.url(&format!("account/{}", account_id))
    }

    pub fn order_url(&self, order_id: &str) -> String {
        self.url(&format!("order/{}", order_id))
    }

    pub fn authorization_url(&self, authz_id: &str) -> String {
        self.url(&format!("authorization/{}", authz_id))
    }

    pub fn challenge_url(&self, authz_id: &str, kind: ChallengeType) -> String {
        self.url(&format!("challenge/{}/{}", authz_id, kind.as_str()))
    }

    pub fn directory(&self) -> Directory {
        Directory {
            new_nonce: self.url("new-nonce"),
            new_account: self.url("new-account"),
            new_order: self.url("new-order"),
            revoke_cert: self.url("revoke-cert"),
            key_change: self.url("key-change"),
            meta: DirectoryMeta {
                terms_of_service: self.config.terms_of_service.clone(),
                caa_identities: self.config.caa_identities.clone(),
                external_account_required: false,
            },
        }
    }

    pub fn new_nonce(&self) -> String {
        self.nonces.get_nonce().0
    }

    /// Decodes the header, redeems the nonce, checks the URL and the
    /// signature, and resolves the signer.
    async fn authenticate(
        &self,
        jws: &JwsRequest,
        url: &str,
        mode: KeyMode,
    ) -> Result<(ProtectedHeader, Requester)> {
        let header = jws.header()?;

        let nonce = header
            .nonce
            .as_deref()
            .ok_or_else(|| PkiError::acme(AcmeErrorKind::BadNonce, "missing nonce"))?;
        if !self.nonces.redeem(nonce) {
            return Err(PkiError::acme(
                AcmeErrorKind::BadNonce,
                "nonce is unknown, expired or already used",
            ));
        }

        if header.url != url {
            return Err(PkiError::acme(
                AcmeErrorKind::Unauthorized,
                format!("request URL {} does not match {}", header.url, url),
            ));
        }

        let requester = match (&header.jwk, &header.kid) {
            (Some(jwk), None) if mode != KeyMode::KidOnly => {
                let (key, thumbprint) = AccountKey::from_jwk(&header.alg, jwk)?;
                jws.verify(&key)?;
                Requester::Key {
                    key,
                    thumbprint,
                    jwk: jwk.clone(),
                }
            }
            (None, Some(kid)) if mode != KeyMode::JwkOnly => {
                let account_id = kid
                    .strip_prefix(&self.url("account/"))
                    .ok_or_else(|| {
                        PkiError::acme(
                            AcmeErrorKind::AccountDoesNotExist,
                            format!("unknown account URL {}", kid),
                        )
                    })?;
                let account = self.accounts.load_account_required(account_id).await?;
                let (key, _) = AccountKey::from_jwk(&header.alg, &account.jwk)?;
                jws.verify(&key)?;
                if account.status != AccountStatus::Valid {
                    return Err(PkiError::acme(
                        AcmeErrorKind::Unauthorized,
                        format!("account {} is {:?}", account.key_id, account.status),
                    ));
                }
                Requester::Account { account, key }
            }
            (Some(_), Some(_)) => {
                return Err(malformed("protected header must not carry both jwk and kid"))
            }
            _ => {
                return Err(malformed(match mode {
                    KeyMode::KidOnly => "this request must be signed with an account kid",
                    KeyMode::JwkOnly => "this request must carry a jwk",
                    KeyMode::Either => "protected header needs a jwk or a kid",
                }))
            }
        };

        Ok((header, requester))
    }

    async fn authenticate_account(
        &self,
        jws: &JwsRequest,
        url: &str,
    ) -> Result<(AcmeAccount, AccountKey)> {
        match self.authenticate(jws, url, KeyMode::KidOnly).await? {
            (_, Requester::Account { account, key }) => Ok((account, key)),
            (_, Requester::Key { .. }) => Err(PkiError::Internal(
                "kid-only authentication returned a bare key".to_string(),
            )),
        }
    }

    fn account_response(&self, account: &AcmeAccount) -> AccountResponse {
        AccountResponse {
            status: account.status,
            contact: account.contact.clone(),
            terms_of_service_agreed: account.terms_of_service_agreed,
            orders: self.url(&format!("account/{}/orders", account.key_id)),
        }
    }

    fn account_outcome(&self, account: &AcmeAccount, created: bool) -> AccountOutcome {
        AccountOutcome {
            created,
            location: self.account_url(&account.key_id),
            account: self.account_response(account),
        }
    }

    pub async fn new_account(&self, jws: &JwsRequest) -> Result<AccountOutcome> {
        let (_, requester) = self
            .authenticate(jws, &self.url("new-account"), KeyMode::JwkOnly)
            .await?;
        let Requester::Key {
            thumbprint, jwk, ..
        } = requester
        else {
            return Err(malformed("new-account must carry a jwk"));
        };
        let payload: NewAccountPayload = jws.payload_json()?;

        if let Some(existing) = self.accounts.load_account_by_key(&thumbprint).await? {
            if existing.status != AccountStatus::Valid {
                return Err(PkiError::acme(
                    AcmeErrorKind::Unauthorized,
                    format!("account {} is {:?}", existing.key_id, existing.status),
                ));
            }
            return Ok(self.account_outcome(&existing, false));
        }

        if payload.only_return_existing {
            return Err(PkiError::acme(
                AcmeErrorKind::AccountDoesNotExist,
                "no account exists for this key",
            ));
        }

        if self.config.terms_of_service.is_some() && !payload.terms_of_service_agreed {
            return Err(malformed("the terms of service must be agreed to"));
        }
        let contact = validate_contacts(&payload.contact)?;

        let account = self
            .accounts
            .create_account(jwk, thumbprint, contact, payload.terms_of_service_agreed)
            .await?;
        Ok(self.account_outcome(&account, true))
    }

    /// POST-as-GET returns the account; a payload may replace the contacts
    /// or deactivate the account.
    pub async fn update_account(&self, jws: &JwsRequest, account_id: &str) -> Result<AccountOutcome> {
        let url = self.account_url(account_id);
        let (mut account, _) = self.authenticate_account(jws, &url).await?;
        if account.key_id != account_id {
            return Err(PkiError::acme(
                AcmeErrorKind::Unauthorized,
                "requests may only modify the signing account",
            ));
        }
        if jws.is_post_as_get() {
            return Ok(self.account_outcome(&account, false));
        }

        let payload: UpdateAccountPayload = jws.payload_json()?;
        if let Some(contact) = payload.contact {
            account.contact = validate_contacts(&contact)?;
        }
        match payload.status.as_deref() {
            None | Some("valid") => {}
            Some("deactivated") => {
                account.status = AccountStatus::Deactivated;
                info!("ACME account {} deactivated", account.key_id);
            }
            Some(other) => {
                return Err(malformed(format!("cannot set account status to {}", other)))
            }
        }

        self.accounts.update_account(&account).await?;
        Ok(self.account_outcome(&account, false))
    }

    /// RFC 8555 section 7.3.5 key rollover.
    pub async fn key_change(&self, jws: &JwsRequest) -> Result<AccountOutcome> {
        let url = self.url("key-change");
        let (account, _) = self.authenticate_account(jws, &url).await?;

        let inner: JwsRequest = jws.payload_json()?;
        let inner_header = inner.header()?;
        if inner_header.kid.is_some() || inner_header.nonce.is_some() {
            return Err(malformed("inner JWS must not carry kid or nonce"));
        }
        if inner_header.url != url {
            return Err(malformed("inner JWS url must match the outer url"));
        }
        let new_jwk = inner_header
            .jwk
            .clone()
            .ok_or_else(|| malformed("inner JWS must carry the new jwk"))?;
        let (new_key, new_thumbprint) = AccountKey::from_jwk(&inner_header.alg, &new_jwk)?;
        inner.verify(&new_key)?;

        let payload: KeyChangePayload = inner.payload_json()?;
        if payload.account != self.account_url(&account.key_id) {
            return Err(malformed("key change names a different account"));
        }
        let old_thumbprint = thumbprint_of(&payload.old_key)?;
        if old_thumbprint != account.thumbprint {
            return Err(malformed("oldKey does not match the account key"));
        }
        if self.accounts.load_account_by_key(&new_thumbprint).await?.is_some() {
            return Err(malformed("the new key is already in use by an account"));
        }

        let updated = self
            .accounts
            .rekey_account(&account, new_jwk, new_thumbprint)
            .await?;
        Ok(self.account_outcome(&updated, false))
    }

    pub async fn new_order(&self, jws: &JwsRequest) -> Result<OrderOutcome> {
        let (account, _) = self
            .authenticate_account(jws, &self.url("new-order"))
            .await?;
        let payload: NewOrderPayload = jws.payload_json()?;
        let identifiers = validate_raw(&payload.identifiers)?;
        if let (Some(not_before), Some(not_after)) = (payload.not_before, payload.not_after) {
            if not_after <= not_before {
                return Err(malformed("notAfter must be later than notBefore"));
            }
        }

        let now = Utc::now();
        let authz_expires = now + chrono_duration(self.config.authorization_lifetime)?;
        let order_expires =
            (now + chrono_duration(self.config.order_lifetime)?).min(authz_expires);

        let mut authorization_ids = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let authz = new_authorization(&account.key_id, identifier, authz_expires);
            self.orders.write_authorization(&authz).await?;
            authorization_ids.push(authz.id);
        }

        let order = AcmeOrder {
            id: Uuid::new_v4().to_string(),
            account_id: account.key_id.clone(),
            status: OrderStatus::Pending,
            expires: order_expires,
            identifiers,
            authorization_ids,
            not_before: payload.not_before,
            not_after: payload.not_after,
            certificate_serial_number: None,
            certificate_expiry: None,
            issuer_id: None,
        };
        self.orders.write_order(&order).await?;
        info!(
            "ACME account {} created order {} for {} identifiers",
            account.key_id,
            order.id,
            order.identifiers.len()
        );

        self.order_outcome(&order).await
    }

    pub async fn get_order(&self, jws: &JwsRequest, order_id: &str) -> Result<OrderOutcome> {
        let (account, _) = self
            .authenticate_account(jws, &self.order_url(order_id))
            .await?;
        let order = self.orders.load_order(&account.key_id, order_id).await?;
        let order = self.refresh_order(order, Utc::now()).await?;
        self.order_outcome(&order).await
    }

    /// Invalid orders are left out of the listing.
    pub async fn list_orders(&self, jws: &JwsRequest, account_id: &str) -> Result<OrderListResponse> {
        let url = self.url(&format!("account/{}/orders", account_id));
        let (account, _) = self.authenticate_account(jws, &url).await?;
        if account.key_id != account_id {
            return Err(PkiError::acme(
                AcmeErrorKind::Unauthorized,
                "order lists are only visible to their account",
            ));
        }

        let now = Utc::now();
        let mut orders = Vec::new();
        for order in self.orders.list_orders(&account.key_id).await? {
            let order = self.refresh_order(order, now).await?;
            if order.status != OrderStatus::Invalid {
                orders.push(self.order_url(&order.id));
            }
        }
        orders.sort();
        Ok(OrderListResponse { orders })
    }

    pub async fn get_authorization(
        &self,
        jws: &JwsRequest,
        authz_id: &str,
    ) -> Result<AuthorizationResponse> {
        let (account, _) = self
            .authenticate_account(jws, &self.authorization_url(authz_id))
            .await?;
        if jws.is_post_as_get() {
            let authz = self.load_authorization(&account.key_id, authz_id, Utc::now()).await?;
            return Ok(self.authorization_response(&authz));
        }

        let payload: UpdateAuthorizationPayload = jws.payload_json()?;
        match payload.status.as_deref() {
            None => {
                let authz = self.load_authorization(&account.key_id, authz_id, Utc::now()).await?;
                Ok(self.authorization_response(&authz))
            }
            Some("deactivated") => {
                self.record_locks
                    .run(
                        format!("authz/{}", authz_id),
                        self.deactivate_authorization(&account.key_id, authz_id),
                    )
                    .await
            }
            Some(other) => Err(malformed(format!(
                "cannot set authorization status to {}",
                other
            ))),
        }
    }

    /// RFC 8555 section 7.5.2: only pending or valid authorizations can be
    /// deactivated.
    async fn deactivate_authorization(
        &self,
        account_id: &str,
        authz_id: &str,
    ) -> Result<AuthorizationResponse> {
        let mut authz = self.load_authorization(account_id, authz_id, Utc::now()).await?;
        match authz.status {
            AuthorizationStatus::Pending | AuthorizationStatus::Valid => {
                authz.status = AuthorizationStatus::Deactivated;
                self.orders.write_authorization(&authz).await?;
                info!("Authorization {} deactivated", authz.id);
                Ok(self.authorization_response(&authz))
            }
            AuthorizationStatus::Deactivated => Ok(self.authorization_response(&authz)),
            AuthorizationStatus::Invalid => Err(malformed(format!(
                "authorization {} is invalid and cannot be deactivated",
                authz.id
            ))),
        }
    }

    /// Runs the validator for one challenge and settles the challenge and its
    /// authorization. Responses for one authorization are handled one at a
    /// time.
    pub async fn respond_challenge(
        &self,
        jws: &JwsRequest,
        authz_id: &str,
        challenge_type: &str,
    ) -> Result<ChallengeResponse> {
        let kind = ChallengeType::parse(challenge_type)?;
        let (account, _) = self
            .authenticate_account(jws, &self.challenge_url(authz_id, kind))
            .await?;
        self.record_locks
            .run(
                format!("authz/{}", authz_id),
                self.settle_challenge(&account, authz_id, kind),
            )
            .await
    }

    async fn settle_challenge(
        &self,
        account: &AcmeAccount,
        authz_id: &str,
        kind: ChallengeType,
    ) -> Result<ChallengeResponse> {
        let mut authz = self.load_authorization(&account.key_id, authz_id, Utc::now()).await?;

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.kind == kind)
            .cloned()
            .ok_or_else(|| malformed(format!("authorization has no {} challenge", kind.as_str())))?;
        if authz.status != AuthorizationStatus::Pending
            || challenge.status != ChallengeStatus::Pending
        {
            return Ok(self.challenge_response(&authz.id, &challenge));
        }

        if let Some(c) = authz.challenge_mut(kind) {
            c.status = ChallengeStatus::Processing;
        }
        self.orders.write_authorization(&authz).await?;

        let key_auth = key_authorization(&challenge.token, &account.thumbprint);
        let outcome = self
            .validator
            .validate(kind, &authz.identifier, &challenge.token, &key_auth)
            .await;

        // Expiry may have settled the authorization while the validator ran.
        let now = Utc::now();
        let mut authz = self.load_authorization(&account.key_id, authz_id, now).await?;
        let settles_authz = authz.status == AuthorizationStatus::Pending;
        match outcome {
            Ok(()) => {
                if let Some(c) = authz.challenge_mut(kind) {
                    c.status = ChallengeStatus::Valid;
                    c.validated = Some(now);
                }
                if settles_authz {
                    authz.status = AuthorizationStatus::Valid;
                    info!(
                        "Authorization {} for {} validated via {}",
                        authz.id,
                        authz.identifier.value,
                        kind.as_str()
                    );
                }
            }
            Err(e) => {
                if let Some(c) = authz.challenge_mut(kind) {
                    c.status = ChallengeStatus::Invalid;
                    c.error = Some(ChallengeError {
                        problem_type: e.acme_kind().problem_type().to_string(),
                        detail: e.to_string(),
                    });
                }
                if settles_authz {
                    authz.status = AuthorizationStatus::Invalid;
                }
                debug!("Authorization {} failed {}: {}", authz.id, kind.as_str(), e);
            }
        }
        self.orders.write_authorization(&authz).await?;

        let settled = authz
            .challenges
            .iter()
            .find(|c| c.kind == kind)
            .cloned()
            .unwrap_or(challenge);
        Ok(self.challenge_response(&authz.id, &settled))
    }

    /// Issues the certificate for a ready order from the submitted CSR. The
    /// order sits in `processing` while the certificate is signed, so a
    /// concurrent finalize sees `orderNotReady`.
    pub async fn finalize_order(&self, jws: &JwsRequest, order_id: &str) -> Result<OrderOutcome> {
        let url = self.url(&format!("order/{}/finalize", order_id));
        let (account, account_key) = self.authenticate_account(jws, &url).await?;
        let payload: FinalizePayload = jws.payload_json()?;
        self.record_locks
            .run(
                format!("order/{}", order_id),
                self.finalize_locked(&account, &account_key, order_id, payload),
            )
            .await
    }

    async fn finalize_locked(
        &self,
        account: &AcmeAccount,
        account_key: &AccountKey,
        order_id: &str,
        payload: FinalizePayload,
    ) -> Result<OrderOutcome> {
        let mut order = self.orders.load_order(&account.key_id, order_id).await?;

        let now = Utc::now();
        if !order.status.is_terminal() && order.is_expired_at(now) {
            order.status = OrderStatus::Invalid;
            self.orders.write_order(&order).await?;
            return Err(malformed(format!("order {} has expired", order.id)));
        }

        let mut order = self.refresh_order(order, now).await?;
        if order.status != OrderStatus::Ready {
            return Err(PkiError::acme(
                AcmeErrorKind::OrderNotReady,
                format!("order {} is {:?}", order.id, order.status),
            ));
        }

        let csr_der = decode_b64(&payload.csr).map_err(|_| bad_csr("csr is not base64url"))?;
        let (dns_names, ip_addresses) = self.check_csr(&order, account_key, &csr_der)?;
        let ttl = self.certificate_ttl(&order, now)?;

        order.status = OrderStatus::Processing;
        self.orders.write_order(&order).await?;

        let signed = self
            .ca
            .sign_csr(
                &self.config.issuer_ref,
                &csr_der,
                SignOptions {
                    ttl: Some(ttl),
                    dns_names: Some(dns_names),
                    ip_addresses: Some(ip_addresses),
                },
            )
            .await;
        let issued = match signed {
            Ok(issued) => issued,
            Err(e) => {
                order.status = OrderStatus::Ready;
                self.orders.write_order(&order).await?;
                return Err(match e {
                    PkiError::InvalidRequest(detail) => bad_csr(detail),
                    other => other,
                });
            }
        };

        order.status = OrderStatus::Valid;
        order.certificate_serial_number = Some(issued.serial_number.clone());
        order.certificate_expiry = Some(issued.expiration);
        order.issuer_id = Some(issued.issuer_id.clone());
        self.orders.write_order(&order).await?;
        info!(
            "Finalized ACME order {} with certificate {}",
            order.id, issued.serial_number
        );

        self.order_outcome(&order).await
    }

    /// Checks the CSR against the order and returns the SANs to issue.
    fn check_csr(
        &self,
        order: &AcmeOrder,
        account_key: &AccountKey,
        csr_der: &[u8],
    ) -> Result<(Vec<String>, Vec<IpAddr>)> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| bad_csr(format!("unparseable CSR: {}", e)))?;
        csr.verify_signature()
            .map_err(|_| bad_csr("CSR signature does not verify"))?;

        let mut dns = Vec::new();
        let mut ips = Vec::new();
        let info = &csr.certification_request_info;
        if let Some(cn) = info.subject.iter_common_name().next() {
            let cn = cn
                .as_str()
                .map_err(|_| bad_csr("CSR common name is not a string"))?;
            match cn.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip.to_string()),
                Err(_) => dns.push(cn.to_string()),
            }
        }
        if let Some(extensions) = csr.requested_extensions() {
            for extension in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = extension {
                    for name in &san.general_names {
                        match name {
                            GeneralName::DNSName(value) => dns.push(value.to_string()),
                            GeneralName::IPAddress(raw) => {
                                let ip = crate::pki::certutil::ip_from_octets(raw)
                                    .ok_or_else(|| bad_csr("CSR carries a malformed IP SAN"))?;
                                ips.push(ip.to_string());
                            }
                            _ => return Err(bad_csr("CSR carries an unsupported SAN type")),
                        }
                    }
                }
            }
        }
        sort_dedup(&mut dns);
        sort_dedup(&mut ips);

        let (order_dns, order_ips) = identifier_sets(&order.identifiers);
        if dns != order_dns || ips != order_ips {
            return Err(bad_csr(format!(
                "CSR names {:?} {:?} do not match the order identifiers {:?} {:?}",
                dns, ips, order_dns, order_ips
            )));
        }

        if account_key.matches_spki(&info.subject_pki) {
            return Err(bad_csr("the CSR must not reuse the account key"));
        }

        let ip_addresses = ips
            .iter()
            .map(|ip| ip.parse::<IpAddr>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| bad_csr("invalid IP address in CSR"))?;
        Ok((dns, ip_addresses))
    }

    fn certificate_ttl(&self, order: &AcmeOrder, now: DateTime<Utc>) -> Result<Duration> {
        let mut ttl = self.config.certificate_ttl;
        if let Some(not_after) = order.not_after {
            let remaining = (not_after - now)
                .to_std()
                .map_err(|_| bad_csr("the order's notAfter is in the past"))?;
            ttl = ttl.min(remaining);
        }
        Ok(ttl)
    }

    /// PEM chain for a valid order: the leaf followed by its issuer chain.
    pub async fn fetch_certificate(&self, jws: &JwsRequest, order_id: &str) -> Result<String> {
        let url = self.url(&format!("order/{}/cert", order_id));
        let (account, _) = self.authenticate_account(jws, &url).await?;
        let order = self.orders.load_order(&account.key_id, order_id).await?;

        let serial = match (&order.status, &order.certificate_serial_number) {
            (OrderStatus::Valid, Some(serial)) => serial.clone(),
            _ => {
                return Err(PkiError::acme(
                    AcmeErrorKind::OrderNotReady,
                    format!("order {} has no certificate", order.id),
                ))
            }
        };
        let der = self
            .certs
            .fetch_cert(&serial)
            .await?
            .ok_or_else(|| PkiError::NotFound(format!("certificate {}", serial)))?;

        let mut chain = der_to_pem(CERTIFICATE_PEM_TAG, &der);
        if let Some(issuer_id) = &order.issuer_id {
            match self.issuers.fetch_issuer(issuer_id).await? {
                Some(issuer) => {
                    for pem in &issuer.ca_chain {
                        chain.push_str(pem);
                    }
                }
                None => warn!(
                    "Issuer {} of order {} no longer exists; returning leaf only",
                    issuer_id, order.id
                ),
            }
        }
        Ok(chain)
    }

    /// Authorizes revoke-cert: the signer must own an order for the
    /// certificate or hold the certificate's key.
    pub async fn authorize_revocation(&self, jws: &JwsRequest) -> Result<RevocationAuthorization> {
        let (_, requester) = self
            .authenticate(jws, &self.url("revoke-cert"), KeyMode::Either)
            .await?;
        let payload: RevokePayload = jws.payload_json()?;
        if let Some(reason) = payload.reason {
            if reason == 7 || reason > 10 {
                return Err(malformed(format!("unsupported revocation reason {}", reason)));
            }
        }

        let der = decode_b64(&payload.certificate)
            .map_err(|_| malformed("certificate is not base64url"))?;
        let details = CertDetails::from_der(&der)
            .map_err(|e| malformed(format!("unparseable certificate: {}", e)))?;
        let stored = self.certs.fetch_cert(&details.serial).await?;
        if stored.as_deref() != Some(der.as_slice()) {
            return Err(PkiError::acme(
                AcmeErrorKind::Unauthorized,
                "certificate was not issued by this CA",
            ));
        }

        let authorized = match &requester {
            Requester::Account { account, .. } => self
                .orders
                .list_orders(&account.key_id)
                .await?
                .iter()
                .any(|order| order.certificate_serial_number.as_deref() == Some(&details.serial)),
            Requester::Key { key, .. } => {
                let (_, cert) = X509Certificate::from_der(&der)
                    .map_err(|e| malformed(format!("unparseable certificate: {}", e)))?;
                key.matches_spki(cert.public_key())
            }
        };
        if !authorized {
            return Err(PkiError::acme(
                AcmeErrorKind::Unauthorized,
                "requester is not authorized to revoke this certificate",
            ));
        }

        Ok(RevocationAuthorization {
            serial_number: details.serial,
            certificate_der: der,
            reason: payload.reason,
        })
    }

    /// Deletes orders and their authorizations once they are past `buffer`
    /// (orders by expiry, valid orders by certificate expiry), and sweeps
    /// expired nonces.
    pub async fn tidy(&self, buffer: Duration, now: DateTime<Utc>) -> Result<AcmeTidyStatus> {
        let cutoff = now - chrono_duration(buffer)?;
        let mut status = AcmeTidyStatus {
            nonces_deleted: self.nonces.tidy_at(now),
            ..Default::default()
        };

        for account_id in self.accounts.list_account_ids().await? {
            for order in self.orders.list_orders(&account_id).await? {
                let end = match order.status {
                    OrderStatus::Valid => order.certificate_expiry.unwrap_or(order.expires),
                    _ => order.expires,
                };
                if end >= cutoff {
                    continue;
                }
                for authz_id in &order.authorization_ids {
                    self.orders.delete_authorization(&account_id, authz_id).await?;
                    status.authorizations_deleted += 1;
                }
                self.orders.delete_order(&account_id, &order.id).await?;
                status.orders_deleted += 1;
            }
        }

        if status.orders_deleted > 0 {
            info!(
                "Tidied {} ACME orders and {} authorizations",
                status.orders_deleted, status.authorizations_deleted
            );
        }
        Ok(status)
    }

    async fn load_authorization(
        &self,
        account_id: &str,
        authz_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AcmeAuthorization> {
        let mut authz = self.orders.load_authorization(account_id, authz_id).await?;
        if authz.status == AuthorizationStatus::Pending && authz.expires < now {
            authz.status = AuthorizationStatus::Invalid;
            self.orders.write_authorization(&authz).await?;
        }
        Ok(authz)
    }

    /// Expires the order or promotes it to ready once every authorization is
    /// valid. Terminal orders are returned unchanged.
    async fn refresh_order(&self, mut order: AcmeOrder, now: DateTime<Utc>) -> Result<AcmeOrder> {
        if order.status.is_terminal() {
            return Ok(order);
        }
        if order.is_expired_at(now) {
            order.status = OrderStatus::Invalid;
            self.orders.write_order(&order).await?;
            return Ok(order);
        }
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Ok(order);
        }

        let mut all_valid = true;
        for authz_id in &order.authorization_ids {
            let authz = self.load_authorization(&order.account_id, authz_id, now).await?;
            match authz.status {
                AuthorizationStatus::Valid => {}
                AuthorizationStatus::Pending => all_valid = false,
                _ => {
                    order.status = OrderStatus::Invalid;
                    self.orders.write_order(&order).await?;
                    return Ok(order);
                }
            }
        }
        if all_valid && order.status == OrderStatus::Pending {
            order.status = OrderStatus::Ready;
            self.orders.write_order(&order).await?;
        }
        Ok(order)
    }

    /// Valid and invalid orders list only their valid authorizations.
    async fn order_outcome(&self, order: &AcmeOrder) -> Result<OrderOutcome> {
        let mut authorization_ids = order.authorization_ids.clone();
        if order.status.is_terminal() {
            let mut kept = Vec::new();
            for authz_id in authorization_ids {
                match self.orders.load_authorization(&order.account_id, &authz_id).await {
                    Ok(authz) if authz.status == AuthorizationStatus::Valid => kept.push(authz_id),
                    Ok(_) | Err(PkiError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            authorization_ids = kept;
        }

        let certificate = match (order.status, &order.certificate_serial_number) {
            (OrderStatus::Valid, Some(_)) => Some(self.url(&format!("order/{}/cert", order.id))),
            _ => None,
        };

        Ok(OrderOutcome {
            location: self.order_url(&order.id),
            order: OrderResponse {
                status: order.status,
                expires: order.expires,
                identifiers: order.identifiers.clone(),
                authorizations: authorization_ids
                    .iter()
                    .map(|id| self.authorization_url(id))
                    .collect(),
                finalize: self.url(&format!("order/{}/finalize", order.id)),
                certificate,
                not_before: order.not_before,
                not_after: order.not_after,
            },
        })
    }

    fn authorization_response(&self, authz: &AcmeAuthorization) -> AuthorizationResponse {
        AuthorizationResponse {
            identifier: authz.identifier.clone(),
            status: authz.status,
            expires: authz.expires,
            challenges: authz
                .challenges
                .iter()
                .map(|c| self.challenge_response(&authz.id, c))
                .collect(),
            wildcard: authz.wildcard,
        }
    }

    fn challenge_response(&self, authz_id: &str, challenge: &AcmeChallenge) -> ChallengeResponse {
        ChallengeResponse {
            kind: challenge.kind,
            url: self.challenge_url(authz_id, challenge.kind),
            status: challenge.status,
            token: challenge.token.clone(),
            validated: challenge.validated,
            error: challenge.error.clone(),
        }
    }
}

/// One authorization per identifier. Wildcards get no http-01 challenge
/// and IP identifiers no dns-01 challenge.
fn new_authorization(
    account_id: &str,
    identifier: &AcmeIdentifier,
    expires: DateTime<Utc>,
) -> AcmeAuthorization {
    let (base, wildcard) = identifier.base_value();
    let mut kinds = Vec::new();
    if !wildcard {
        kinds.push(ChallengeType::Http01);
    }
    if identifier.kind == IdentifierType::Dns {
        kinds.push(ChallengeType::Dns01);
    }

    AcmeAuthorization {
        id: Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        identifier: AcmeIdentifier {
            kind: identifier.kind,
            value: base.to_string(),
        },
        wildcard,
        status: AuthorizationStatus::Pending,
        expires,
        challenges: kinds
            .into_iter()
            .map(|kind| AcmeChallenge {
                kind,
                status: ChallengeStatus::Pending,
                token: new_token(),
                validated: None,
                error: None,
            })
            .collect(),
    }
}

fn thumbprint_of(jwk: &Value) -> Result<String> {
    let alg = match (jwk.get("kty").and_then(Value::as_str), jwk.get("crv").and_then(Value::as_str)) {
        (Some("EC"), Some("P-256")) => "ES256",
        (Some("EC"), Some("P-384")) => "ES384",
        (Some("OKP"), Some("Ed25519")) => "EdDSA",
        (Some("RSA"), _) => "RS256",
        _ => return Err(malformed("unsupported key in oldKey")),
    };
    Ok(AccountKey::from_jwk(alg, jwk)?.1)
}

fn malformed(detail: impl Into<String>) -> PkiError {
    PkiError::acme(AcmeErrorKind::Malformed, detail)
}

fn bad_csr(detail: impl Into<String>) -> PkiError {
    PkiError::acme(AcmeErrorKind::BadCsr, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::challenge::RejectingValidator;
    use crate::acme::jws::encode_b64;
    use crate::acme::jws::test_support::ClientKey;
    use crate::config::IssuanceConfig;
    use crate::pki::GenerateRootRequest;
    use crate::storage::{MemoryStorage, Storage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct AcceptAll;

    #[async_trait]
    impl ChallengeValidator for AcceptAll {
        async fn validate(
            &self,
            _kind: ChallengeType,
            _identifier: &AcmeIdentifier,
            _token: &str,
            _key_authorization: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    async fn state_with(validator: Arc<dyn ChallengeValidator>) -> AcmeState {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let issuers = IssuerStore::new(storage.clone());
        let certs = CertStore::new(storage.clone());
        let ca = CertificateAuthority::new(issuers.clone(), certs.clone(), IssuanceConfig::default());
        ca.generate_root(GenerateRootRequest {
            common_name: "ACME Root".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        AcmeState::new(
            AcmeConfig::default(),
            AccountStore::new(storage.clone()),
            OrderStore::new(storage),
            ca,
            issuers,
            certs,
            validator,
        )
    }

    async fn register(state: &AcmeState, client: &ClientKey) -> String {
        let jws = client.sign_jwk(
            Some(&state.new_nonce()),
            &state.url("new-account"),
            Some(json!({"termsOfServiceAgreed": true})),
        );
        state.new_account(&jws).await.unwrap().location
    }

    async fn order_for(state: &AcmeState, client: &ClientKey, kid: &str, ids: Value) -> OrderOutcome {
        let jws = client.sign_kid(
            &state.new_nonce(),
            &state.url("new-order"),
            kid,
            Some(json!({ "identifiers": ids })),
        );
        state.new_order(&jws).await.unwrap()
    }

    fn id_from_url(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }

    async fn validate_all(state: &AcmeState, client: &ClientKey, kid: &str, order: &OrderOutcome) {
        for authz_url in &order.order.authorizations {
            let authz_id = id_from_url(authz_url);
            let url = state.challenge_url(authz_id, ChallengeType::Dns01);
            let jws = client.sign_kid(&state.new_nonce(), &url, kid, Some(json!({})));
            let challenge = state.respond_challenge(&jws, authz_id, "dns-01").await.unwrap();
            assert_eq!(challenge.status, ChallengeStatus::Valid);
        }
    }

    fn csr_for(names: &[&str]) -> String {
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.subject_alt_names = names
            .iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => rcgen::SanType::IpAddress(ip),
                Err(_) => rcgen::SanType::DnsName(name.to_string()),
            })
            .collect();
        let cert = rcgen::Certificate::from_params(params).unwrap();
        encode_b64(&cert.serialize_request_der().unwrap())
    }

    async fn finalize(
        state: &AcmeState,
        client: &ClientKey,
        kid: &str,
        order_id: &str,
        csr: String,
    ) -> Result<OrderOutcome> {
        let url = state.url(&format!("order/{}/finalize", order_id));
        let jws = client.sign_kid(&state.new_nonce(), &url, kid, Some(json!({ "csr": csr })));
        state.finalize_order(&jws, order_id).await
    }

    #[tokio::test]
    async fn test_full_order_flow() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;

        let order = order_for(
            &state,
            &client,
            &kid,
            json!([{"type": "dns", "value": "www.example.com"}, {"type": "dns", "value": "example.com"}]),
        )
        .await;
        assert_eq!(order.order.status, OrderStatus::Pending);
        assert_eq!(order.order.authorizations.len(), 2);
        let order_id = id_from_url(&order.location).to_string();

        let err = finalize(&state, &client, &kid, &order_id, csr_for(&["example.com"]))
            .await
            .unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::OrderNotReady);

        validate_all(&state, &client, &kid, &order).await;

        let done = finalize(
            &state,
            &client,
            &kid,
            &order_id,
            csr_for(&["example.com", "www.example.com"]),
        )
        .await
        .unwrap();
        assert_eq!(done.order.status, OrderStatus::Valid);
        assert!(done.order.certificate.is_some());

        let url = state.url(&format!("order/{}/cert", order_id));
        let jws = client.sign_kid(&state.new_nonce(), &url, &kid, None);
        let chain = state.fetch_certificate(&jws, &order_id).await.unwrap();
        assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);

        let err = finalize(&state, &client, &kid, &order_id, csr_for(&["example.com"]))
            .await
            .unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::OrderNotReady);
    }

    #[tokio::test]
    async fn test_finalize_rejects_mismatched_identifiers() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let order = order_for(
            &state,
            &client,
            &kid,
            json!([{"type": "dns", "value": "a.example.com"}, {"type": "ip", "value": "10.0.0.1"}]),
        )
        .await;
        let order_id = id_from_url(&order.location).to_string();
        validate_all_http(&state, &client, &kid, &order).await;

        let err = finalize(&state, &client, &kid, &order_id, csr_for(&["a.example.com"]))
            .await
            .unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::BadCsr);

        let err = finalize(
            &state,
            &client,
            &kid,
            &order_id,
            csr_for(&["a.example.com", "b.example.com", "10.0.0.1"]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::BadCsr);

        let done = finalize(&state, &client, &kid, &order_id, csr_for(&["a.example.com", "10.0.0.1"]))
            .await
            .unwrap();
        assert_eq!(done.order.status, OrderStatus::Valid);
    }

    async fn validate_all_http(state: &AcmeState, client: &ClientKey, kid: &str, order: &OrderOutcome) {
        for authz_url in &order.order.authorizations {
            let authz_id = id_from_url(authz_url);
            let url = state.challenge_url(authz_id, ChallengeType::Http01);
            let jws = client.sign_kid(&state.new_nonce(), &url, kid, Some(json!({})));
            state.respond_challenge(&jws, authz_id, "http-01").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_finalize_rejects_account_key_reuse() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let order = order_for(&state, &client, &kid, json!([{"type": "dns", "value": "a.example.com"}])).await;
        let order_id = id_from_url(&order.location).to_string();
        validate_all(&state, &client, &kid, &order).await;

        let mut params = rcgen::CertificateParams::new(vec!["a.example.com".to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.key_pair = Some(rcgen::KeyPair::from_pem(&client.pkcs8_pem()).unwrap());
        let csr = rcgen::Certificate::from_params(params)
            .unwrap()
            .serialize_request_der()
            .unwrap();

        let err = finalize(&state, &client, &kid, &order_id, encode_b64(&csr))
            .await
            .unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::BadCsr);
    }

    #[tokio::test]
    async fn test_failed_challenge_invalidates_order_and_hides_it() {
        let state = state_with(Arc::new(RejectingValidator)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let good = order_for(&state, &client, &kid, json!([{"type": "dns", "value": "a.example.com"}])).await;
        let bad = order_for(
            &state,
            &client,
            &kid,
            json!([{"type": "dns", "value": "b.example.com"}, {"type": "dns", "value": "c.example.com"}]),
        )
        .await;

        let authz_id = id_from_url(&bad.order.authorizations[0]).to_string();
        let url = state.challenge_url(&authz_id, ChallengeType::Dns01);
        let jws = client.sign_kid(&state.new_nonce(), &url, &kid, Some(json!({})));
        let challenge = state.respond_challenge(&jws, &authz_id, "dns-01").await.unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Invalid);
        assert!(challenge.error.is_some());

        let bad_id = id_from_url(&bad.location).to_string();
        let jws = client.sign_kid(&state.new_nonce(), &state.order_url(&bad_id), &kid, None);
        let fetched = state.get_order(&jws, &bad_id).await.unwrap();
        assert_eq!(fetched.order.status, OrderStatus::Invalid);
        assert!(fetched.order.authorizations.is_empty());

        let account_id = id_from_url(&kid).to_string();
        let url = state.url(&format!("account/{}/orders", account_id));
        let jws = client.sign_kid(&state.new_nonce(), &url, &kid, None);
        let listing = state.list_orders(&jws, &account_id).await.unwrap();
        assert_eq!(listing.orders, vec![good.location.clone()]);
    }

    #[tokio::test]
    async fn test_pending_order_lists_all_authorizations() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let order = order_for(
            &state,
            &client,
            &kid,
            json!([{"type": "dns", "value": "a.example.com"}, {"type": "dns", "value": "*.example.com"}]),
        )
        .await;
        let order_id = id_from_url(&order.location).to_string();

        let jws = client.sign_kid(&state.new_nonce(), &state.order_url(&order_id), &kid, None);
        let fetched = state.get_order(&jws, &order_id).await.unwrap();
        assert_eq!(fetched.order.status, OrderStatus::Pending);
        assert_eq!(fetched.order.authorizations, order.order.authorizations);

        let mut saw_wildcard = false;
        for authz_url in &fetched.order.authorizations {
            let authz_id = id_from_url(authz_url);
            let jws = client.sign_kid(&state.new_nonce(), authz_url, &kid, None);
            let authz = state.get_authorization(&jws, authz_id).await.unwrap();
            if authz.wildcard {
                saw_wildcard = true;
                assert_eq!(authz.identifier.value, "example.com");
                assert_eq!(authz.challenges.len(), 1);
                assert_eq!(authz.challenges[0].kind, ChallengeType::Dns01);
            }
        }
        assert!(saw_wildcard);
    }

    #[tokio::test]
    async fn test_nonce_is_checked_first_and_only_once() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let nonce = state.new_nonce();
        let jws = client.sign_jwk(
            Some(&nonce),
            &state.url("new-account"),
            Some(json!({"termsOfServiceAgreed": true})),
        );
        let first = state.new_account(&jws).await.unwrap();
        assert!(first.created);

        let err = state.new_account(&jws).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::BadNonce);

        let jws = client.sign_jwk(None, &state.url("new-account"), Some(json!({})));
        let err = state.new_account(&jws).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::BadNonce);

        let again = client.sign_jwk(
            Some(&state.new_nonce()),
            &state.url("new-account"),
            Some(json!({"onlyReturnExisting": true})),
        );
        let existing = state.new_account(&again).await.unwrap();
        assert!(!existing.created);
        assert_eq!(existing.location, first.location);
    }

    #[tokio::test]
    async fn test_only_return_existing_for_unknown_key() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let jws = client.sign_jwk(
            Some(&state.new_nonce()),
            &state.url("new-account"),
            Some(json!({"onlyReturnExisting": true})),
        );
        let err = state.new_account(&jws).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::AccountDoesNotExist);
    }

    #[tokio::test]
    async fn test_url_mismatch_is_unauthorized() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let jws = client.sign_jwk(
            Some(&state.new_nonce()),
            &state.url("new-order"),
            Some(json!({"termsOfServiceAgreed": true})),
        );
        let err = state.new_account(&jws).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_deactivated_account_is_locked_out() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let account_id = id_from_url(&kid).to_string();

        let jws = client.sign_kid(
            &state.new_nonce(),
            &kid,
            &kid,
            Some(json!({"status": "deactivated"})),
        );
        let outcome = state.update_account(&jws, &account_id).await.unwrap();
        assert_eq!(outcome.account.status, AccountStatus::Deactivated);

        let jws = client.sign_kid(
            &state.new_nonce(),
            &state.url("new-order"),
            &kid,
            Some(json!({"identifiers": [{"type": "dns", "value": "a.example.com"}]})),
        );
        let err = state.new_order(&jws).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_revocation_requires_ownership_or_key() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let owner = ClientKey::generate();
        let kid = register(&state, &owner).await;
        let order = order_for(&state, &owner, &kid, json!([{"type": "dns", "value": "a.example.com"}])).await;
        let order_id = id_from_url(&order.location).to_string();
        validate_all(&state, &owner, &kid, &order).await;
        finalize(&state, &owner, &kid, &order_id, csr_for(&["a.example.com"]))
            .await
            .unwrap();

        let url = state.url(&format!("order/{}/cert", order_id));
        let jws = owner.sign_kid(&state.new_nonce(), &url, &kid, None);
        let chain = state.fetch_certificate(&jws, &order_id).await.unwrap();
        let leaf = pem::parse_many(&chain).unwrap().remove(0).into_contents();
        let payload = json!({ "certificate": encode_b64(&leaf) });

        let stranger = ClientKey::generate();
        let stranger_kid = register(&state, &stranger).await;
        let jws = stranger.sign_kid(
            &state.new_nonce(),
            &state.url("revoke-cert"),
            &stranger_kid,
            Some(payload.clone()),
        );
        let err = state.authorize_revocation(&jws).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::Unauthorized);

        let jws = owner.sign_kid(&state.new_nonce(), &state.url("revoke-cert"), &kid, Some(payload));
        let authorized = state.authorize_revocation(&jws).await.unwrap();
        let details = CertDetails::from_der(&leaf).unwrap();
        assert_eq!(authorized.serial_number, details.serial);
    }

    #[tokio::test]
    async fn test_key_change_moves_account() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let old = ClientKey::generate();
        let kid = register(&state, &old).await;
        let new = ClientKey::generate();

        let url = state.url("key-change");
        let inner = new.sign_jwk(
            None,
            &url,
            Some(json!({ "account": kid, "oldKey": old.jwk() })),
        );
        let outer = old.sign_kid(
            &state.new_nonce(),
            &url,
            &kid,
            Some(serde_json::to_value(&inner).unwrap()),
        );
        let outcome = state.key_change(&outer).await.unwrap();
        assert_eq!(outcome.location, kid);

        assert!(state
            .accounts()
            .load_account_by_key(&old.thumbprint())
            .await
            .unwrap()
            .is_none());
        assert!(state
            .accounts()
            .load_account_by_key(&new.thumbprint())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_tidy_removes_expired_orders() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        order_for(&state, &client, &kid, json!([{"type": "dns", "value": "a.example.com"}])).await;

        let status = state.tidy(Duration::from_secs(3600), Utc::now()).await.unwrap();
        assert_eq!(status.orders_deleted, 0);

        let later = Utc::now() + chrono::Duration::days(3);
        let status = state.tidy(Duration::from_secs(3600), later).await.unwrap();
        assert_eq!(status.orders_deleted, 1);
        assert_eq!(status.authorizations_deleted, 1);
    }

    /// dns-01 passes after a delay, http-01 fails at once.
    struct SlowDnsFastHttpFailure;

    #[async_trait]
    impl ChallengeValidator for SlowDnsFastHttpFailure {
        async fn validate(
            &self,
            kind: ChallengeType,
            _identifier: &AcmeIdentifier,
            _token: &str,
            _key_authorization: &str,
        ) -> Result<()> {
            match kind {
                ChallengeType::Dns01 => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
                ChallengeType::Http01 => Err(PkiError::acme(
                    AcmeErrorKind::Unauthorized,
                    "http-01 response did not match",
                )),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_challenges_settle_authorization_once() {
        let state = Arc::new(state_with(Arc::new(SlowDnsFastHttpFailure)).await);
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let order = order_for(&state, &client, &kid, json!([{"type": "dns", "value": "race.example.com"}])).await;
        let authz_id = id_from_url(&order.order.authorizations[0]).to_string();

        let mut handles = Vec::new();
        for kind in [ChallengeType::Dns01, ChallengeType::Http01] {
            let url = state.challenge_url(&authz_id, kind);
            let jws = client.sign_kid(&state.new_nonce(), &url, &kid, Some(json!({})));
            let state = state.clone();
            let authz_id = authz_id.clone();
            handles.push(tokio::spawn(async move {
                state.respond_challenge(&jws, &authz_id, kind.as_str()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let authz = state.orders.load_authorization(id_from_url(&kid), &authz_id).await.unwrap();
        let settled: Vec<_> = authz
            .challenges
            .iter()
            .filter(|c| c.status != ChallengeStatus::Pending)
            .collect();
        assert_eq!(settled.len(), 1);
        let expected = match settled[0].status {
            ChallengeStatus::Valid => AuthorizationStatus::Valid,
            _ => AuthorizationStatus::Invalid,
        };
        assert_eq!(authz.status, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finalize_issues_one_certificate() {
        let state = Arc::new(state_with(Arc::new(AcceptAll)).await);
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let order = order_for(&state, &client, &kid, json!([{"type": "dns", "value": "once.example.com"}])).await;
        let order_id = id_from_url(&order.location).to_string();
        validate_all(&state, &client, &kid, &order).await;
        let certs_before = state.certs.list_cert_serials().await.unwrap().len();

        let url = state.url(&format!("order/{}/finalize", order_id));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let jws = client.sign_kid(
                &state.new_nonce(),
                &url,
                &kid,
                Some(json!({ "csr": csr_for(&["once.example.com"]) })),
            );
            let state = state.clone();
            let order_id = order_id.clone();
            handles.push(tokio::spawn(async move {
                state.finalize_order(&jws, &order_id).await
            }));
        }

        let mut finalized = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.order.status, OrderStatus::Valid);
                    finalized += 1;
                }
                Err(e) => assert_eq!(e.acme_kind(), AcmeErrorKind::OrderNotReady),
            }
        }
        assert_eq!(finalized, 1);
        assert_eq!(
            state.certs.list_cert_serials().await.unwrap().len(),
            certs_before + 1
        );
    }

    #[tokio::test]
    async fn test_deactivated_authorization_invalidates_order() {
        let state = state_with(Arc::new(AcceptAll)).await;
        let client = ClientKey::generate();
        let kid = register(&state, &client).await;
        let order = order_for(&state, &client, &kid, json!([{"type": "dns", "value": "gone.example.com"}])).await;
        let order_id = id_from_url(&order.location).to_string();
        validate_all(&state, &client, &kid, &order).await;

        let authz_id = id_from_url(&order.order.authorizations[0]).to_string();
        let url = state.authorization_url(&authz_id);
        let jws = client.sign_kid(&state.new_nonce(), &url, &kid, Some(json!({"status": "deactivated"})));
        let authz = state.get_authorization(&jws, &authz_id).await.unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Deactivated);

        let jws = client.sign_kid(&state.new_nonce(), &url, &kid, Some(json!({"status": "valid"})));
        let err = state.get_authorization(&jws, &authz_id).await.unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::Malformed);

        let err = finalize(&state, &client, &kid, &order_id, csr_for(&["gone.example.com"]))
            .await
            .unwrap_err();
        assert_eq!(err.acme_kind(), AcmeErrorKind::OrderNotReady);
        let url = state.url(&format!("order/{}", order_id));
        let jws = client.sign_kid(&state.new_nonce(), &url, &kid, None);
        let fetched = state.get_order(&jws, &order_id).await.unwrap();
        assert_eq!(fetched.order.status, OrderStatus::Invalid);
        assert!(fetched.order.authorizations.is_empty());
    }
}
