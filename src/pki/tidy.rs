//! Storage clean-up: expired certificates, stale revocation records, broken
//! issuer associations and expired issuers.

use crate::config::TidyConfig;
use crate::error::Result;
use crate::pki::ca::chrono_duration;
use crate::pki::cert_store::CertStore;
use crate::pki::certutil::CertDetails;
use crate::pki::crl::CrlRebuilder;
use crate::pki::issuer::IssuerStore;
use crate::pki::revocation::RevocationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TidyRequest {
    #[serde(default)]
    pub tidy_cert_store: bool,
    #[serde(default)]
    pub tidy_revoked_certs: bool,
    #[serde(default)]
    pub tidy_revoked_cert_issuer_associations: bool,
    #[serde(default)]
    pub tidy_expired_issuers: bool,
    #[serde(default)]
    pub tidy_acme: bool,
    /// Overrides the configured safety buffer.
    #[serde(default, with = "crate::config::humantime_serde::option")]
    pub safety_buffer: Option<Duration>,
}

impl Default for TidyRequest {
    fn default() -> Self {
        Self {
            tidy_cert_store: true,
            tidy_revoked_certs: true,
            tidy_revoked_cert_issuer_associations: false,
            tidy_expired_issuers: false,
            tidy_acme: false,
            safety_buffer: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TidyStatus {
    pub cert_store_deleted: usize,
    pub revoked_cert_deleted: usize,
    /// Records whose issuer no longer exists; association cleared.
    pub missing_issuer_cert_count: usize,
    pub revoked_cert_reassociated: usize,
    pub expired_issuers_deleted: usize,
    pub acme_orders_deleted: usize,
    pub acme_nonces_deleted: usize,
    pub crl_rebuild_requested: bool,
}

pub struct Tidy {
    issuers: IssuerStore,
    certs: CertStore,
    revocations: Arc<RevocationStore>,
}

impl Tidy {
    pub fn new(issuers: IssuerStore, certs: CertStore, revocations: Arc<RevocationStore>) -> Self {
        Self {
            issuers,
            certs,
            revocations,
        }
    }

    pub async fn run(
        &self,
        request: &TidyRequest,
        config: &TidyConfig,
        rebuilder: &CrlRebuilder,
        cancel: &CancellationToken,
    ) -> Result<TidyStatus> {
        self.run_at(request, config, rebuilder, cancel, Utc::now()).await
    }

    /// Runs the requested passes as if the current time were `now`.
    pub async fn run_at(
        &self,
        request: &TidyRequest,
        config: &TidyConfig,
        rebuilder: &CrlRebuilder,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<TidyStatus> {
        let buffer = chrono_duration(request.safety_buffer.unwrap_or(config.safety_buffer))?;
        let cutoff = now - buffer;
        let mut status = TidyStatus::default();

        info!(
            cert_store = request.tidy_cert_store,
            revoked_certs = request.tidy_revoked_certs,
            associations = request.tidy_revoked_cert_issuer_associations,
            expired_issuers = request.tidy_expired_issuers,
            "Starting tidy"
        );

        if request.tidy_cert_store && !cancel.is_cancelled() {
            status.cert_store_deleted = self.tidy_cert_store(cutoff).await?;
        }

        if request.tidy_revoked_certs && !cancel.is_cancelled() {
            status.revoked_cert_deleted = self.tidy_revoked(cutoff).await?;
        }

        if request.tidy_revoked_cert_issuer_associations && !cancel.is_cancelled() {
            let (cleared, reassociated) = self.repair_issuer_associations().await?;
            status.missing_issuer_cert_count = cleared;
            status.revoked_cert_reassociated = reassociated;
        }

        if request.tidy_expired_issuers && !cancel.is_cancelled() {
            status.expired_issuers_deleted = self.tidy_expired_issuers(cutoff).await?;
        }

        if status.revoked_cert_deleted > 0
            || status.missing_issuer_cert_count > 0
            || status.revoked_cert_reassociated > 0
            || status.expired_issuers_deleted > 0
        {
            rebuilder.request_rebuild();
            status.crl_rebuild_requested = true;
        }

        info!(
            cert_store_deleted = status.cert_store_deleted,
            revoked_cert_deleted = status.revoked_cert_deleted,
            missing_issuer_cert_count = status.missing_issuer_cert_count,
            revoked_cert_reassociated = status.revoked_cert_reassociated,
            expired_issuers_deleted = status.expired_issuers_deleted,
            "Tidy finished"
        );
        Ok(status)
    }

    async fn tidy_cert_store(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;
        for serial in self.certs.list_cert_serials().await? {
            let Some(der) = self.certs.fetch_cert(&serial).await? else {
                continue;
            };
            let details = match CertDetails::from_der(&der) {
                Ok(details) => details,
                Err(e) => {
                    warn!("Skipping unparseable certificate {}: {}", serial, e);
                    continue;
                }
            };
            if details.not_after < cutoff {
                self.certs.delete_cert(&serial).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn tidy_revoked(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;
        for record in self.revocations.list_records().await? {
            if record.certificate_expiry >= cutoff {
                continue;
            }
            self.revocations.delete(&record.serial_number).await?;
            self.certs.delete_cert(&record.serial_number).await?;
            debug!("Tidied revoked certificate {}", record.serial_number);
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Clears associations to deleted issuers and fills in missing ones from
    /// the current issuer set.
    async fn repair_issuer_associations(&self) -> Result<(usize, usize)> {
        let known: HashSet<String> = self.issuers.list_issuer_ids().await?.into_iter().collect();
        let mut cleared = 0;
        let mut reassociated = 0;

        for mut record in self.revocations.list_records().await? {
            let mut changed = false;
            match record.certificate_issuer.as_deref() {
                Some(id) if known.contains(id) => continue,
                Some(id) => {
                    info!(
                        "Revoked certificate {} referenced missing issuer {}; clearing",
                        record.serial_number, id
                    );
                    record.certificate_issuer = None;
                    cleared += 1;
                    changed = true;
                }
                None => {}
            }

            if record.certificate_issuer.is_none() {
                if let Some(issuer_id) =
                    self.issuers.find_signing_issuer(&record.certificate_der).await?
                {
                    info!(
                        "Associating revoked certificate {} with issuer {}",
                        record.serial_number, issuer_id
                    );
                    record.certificate_issuer = Some(issuer_id);
                    reassociated += 1;
                    changed = true;
                }
            }

            if changed {
                self.revocations.write(&record).await?;
            }
        }
        Ok((cleared, reassociated))
    }

    async fn tidy_expired_issuers(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let default_id = self.issuers.issuer_defaults().await?.default_issuer_id;
        let mut deleted = 0;
        for issuer in self.issuers.list_issuers().await? {
            if default_id.as_deref() == Some(issuer.id.as_str()) {
                continue;
            }
            let Ok(details) = issuer.details() else {
                continue;
            };
            if details.not_after < cutoff {
                self.issuers.delete_issuer(&issuer.id).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.issuers.rebuild_chains().await?;
        }
        Ok(deleted)
    }
}
