//! One mounted PKI engine: every store, the CRL rebuilder, the ACME state and
//! the background scheduler, tied to a single storage view.

use crate::acme::{AcmeState, AccountStore, ChallengeValidator, OrderStore, RejectingValidator};
use crate::config::{CrlConfig, CrlConfigUpdate, EngineConfig};
use crate::error::{AcmeErrorKind, PkiError, Result};
use crate::pki::crl::{
    CrlBuildReport, CrlBuilder, CrlKind, CrlRebuilder, PeriodicTask, RebuildOutcome,
};
use crate::pki::{
    CertStore, CertificateAuthority, IssuerEntry, IssuerStore, RevocationOutcome, RevocationStore,
    Tidy, TidyRequest, TidyStatus,
};
use crate::storage::{get_json, put_json, Storage};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CRL_CONFIG_KEY: &str = "config/crl";

pub struct PkiBackend {
    storage: Arc<dyn Storage>,
    config: EngineConfig,
    crl_config: RwLock<CrlConfig>,
    issuers: IssuerStore,
    certs: CertStore,
    ca: CertificateAuthority,
    revocations: Arc<RevocationStore>,
    rebuilder: CrlRebuilder,
    tidy: Tidy,
    acme: AcmeState,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PkiBackend {
    /// Mount setup with a validator that fails every ACME challenge.
    pub async fn setup(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Arc<Self>> {
        Self::setup_with_validator(storage, config, Arc::new(RejectingValidator)).await
    }

    pub async fn setup_with_validator(
        storage: Arc<dyn Storage>,
        config: EngineConfig,
        validator: Arc<dyn ChallengeValidator>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let crl_config = match get_json::<CrlConfig>(storage.as_ref(), CRL_CONFIG_KEY).await? {
            Some(stored) => stored,
            None => config.crl.clone(),
        };

        let issuers = IssuerStore::new(storage.clone());
        let certs = CertStore::new(storage.clone());
        let ca = CertificateAuthority::new(issuers.clone(), certs.clone(), config.issuance.clone());
        let revocations = Arc::new(RevocationStore::new(
            storage.clone(),
            issuers.clone(),
            certs.clone(),
        ));
        let shutdown = CancellationToken::new();
        let rebuilder = CrlRebuilder::new(
            CrlBuilder::new(storage.clone(), issuers.clone(), revocations.clone()),
            revocations.clone(),
            shutdown.child_token(),
        );
        let tidy = Tidy::new(issuers.clone(), certs.clone(), revocations.clone());
        let acme = AcmeState::new(
            config.acme.clone(),
            AccountStore::new(storage.clone()),
            OrderStore::new(storage.clone()),
            ca.clone(),
            issuers.clone(),
            certs.clone(),
            validator,
        );

        rebuilder.reload_from_storage().await?;

        info!(
            auto_rebuild = crl_config.auto_rebuild,
            enable_delta = crl_config.enable_delta,
            "PKI backend set up"
        );

        Ok(Arc::new(Self {
            storage,
            config,
            crl_config: RwLock::new(crl_config),
            issuers,
            certs,
            ca,
            revocations,
            rebuilder,
            tidy,
            acme,
            shutdown,
            scheduler: Mutex::new(None),
        }))
    }

    /// Starts the background tick if the configuration enables it. Calling
    /// it again while running does nothing.
    pub fn start_scheduler(self: &Arc<Self>) {
        if !self.config.scheduler.enabled {
            debug!("Scheduler disabled by configuration");
            return;
        }
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(crate::pki::crl::spawn_scheduler(
            self.clone(),
            self.config.scheduler.tick_interval,
            &self.shutdown,
        ));
    }

    /// Stops the scheduler and any rebuild waiting on the shutdown token.
    pub async fn cleanup(&self) {
        self.shutdown.cancel();
        let running = self.scheduler.lock().take();
        if let Some((_, handle)) = running {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("PKI backend cleaned up");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn issuers(&self) -> &IssuerStore {
        &self.issuers
    }

    pub fn certs(&self) -> &CertStore {
        &self.certs
    }

    pub fn revocations(&self) -> &RevocationStore {
        &self.revocations
    }

    pub fn rebuilder(&self) -> &CrlRebuilder {
        &self.rebuilder
    }

    pub fn acme(&self) -> &AcmeState {
        &self.acme
    }

    pub fn crl_config(&self) -> CrlConfig {
        self.crl_config.read().clone()
    }

    /// Applies and persists a CRL configuration update. Toggling `disable` or
    /// delta generation schedules a full rebuild.
    pub async fn update_crl_config(&self, update: &CrlConfigUpdate) -> Result<CrlConfig> {
        let current = self.crl_config();
        let next = update.apply(&current)?;
        put_json(self.storage.as_ref(), CRL_CONFIG_KEY, &next).await?;
        *self.crl_config.write() = next.clone();

        if next.disable != current.disable || next.delta_active() != current.delta_active() {
            self.rebuilder.request_rebuild();
            if !next.auto_rebuild {
                self.rebuilder.rebuild_if_forced(&next).await?;
            }
        }
        info!("CRL configuration updated");
        Ok(next)
    }

    /// Rebuilds every complete CRL now (and the deltas when enabled).
    pub async fn rotate_crl(&self) -> Result<CrlBuildReport> {
        match self.rebuilder.rebuild(&self.crl_config(), true).await? {
            RebuildOutcome::Built(report) => Ok(report),
            other => Err(PkiError::Internal(format!(
                "forced CRL rebuild did not run: {:?}",
                other
            ))),
        }
    }

    pub async fn rotate_delta_crl(&self) -> Result<CrlBuildReport> {
        match self.rebuilder.rebuild_delta(&self.crl_config()).await? {
            RebuildOutcome::Built(report) => Ok(report),
            other => Err(PkiError::Internal(format!(
                "delta CRL rebuild did not run: {:?}",
                other
            ))),
        }
    }

    /// The CRL of the current default issuer.
    pub async fn default_crl(&self, kind: CrlKind) -> Result<Option<Vec<u8>>> {
        let Some(default) = self.issuers.issuer_defaults().await?.default_issuer_id else {
            return Ok(None);
        };
        self.rebuilder.builder().fetch_issuer_crl(&default, kind).await
    }

    pub async fn issuer_crl(&self, issuer_ref: &str, kind: CrlKind) -> Result<Option<Vec<u8>>> {
        let issuer_id = self.issuers.resolve_issuer_ref(issuer_ref).await?;
        self.rebuilder.builder().fetch_issuer_crl(&issuer_id, kind).await
    }

    pub async fn revoke_serial(&self, serial: &str) -> Result<RevocationOutcome> {
        let config = self.crl_config();
        let outcome = self.revocations.revoke_serial(serial, config.delta_active()).await?;
        self.after_revocation(&config, &outcome).await;
        Ok(outcome)
    }

    pub async fn revoke_certificate(&self, pem: &str) -> Result<RevocationOutcome> {
        let config = self.crl_config();
        let outcome = self.revocations.revoke_certificate(pem, config.delta_active()).await?;
        self.after_revocation(&config, &outcome).await;
        Ok(outcome)
    }

    /// A revocation is durable once recorded; a failed follow-up CRL build is
    /// logged and left to the next rotate or tick.
    async fn after_revocation(&self, config: &CrlConfig, outcome: &RevocationOutcome) {
        if !outcome.newly_revoked {
            return;
        }
        if config.delta_active() {
            self.rebuilder.request_delta_rebuild();
        } else {
            self.rebuilder.request_rebuild();
        }
        if !config.auto_rebuild {
            if let Err(e) = self.rebuilder.rebuild_if_forced(config).await {
                warn!(
                    "CRL rebuild after revoking {} failed: {}",
                    outcome.serial_number, e
                );
            }
        }
    }

    /// Deletes an issuer; CRLs are rebuilt so the old group disappears.
    pub async fn delete_issuer(&self, issuer_ref: &str) -> Result<IssuerEntry> {
        let deleted = self.issuers.delete_issuer(issuer_ref).await?;
        self.issuers.rebuild_chains().await?;
        self.rebuilder.request_rebuild();
        let config = self.crl_config();
        if !config.auto_rebuild {
            if let Err(e) = self.rebuilder.rebuild_if_forced(&config).await {
                warn!("CRL rebuild after deleting issuer {} failed: {}", deleted.id, e);
            }
        }
        Ok(deleted)
    }

    pub async fn tidy(&self, request: &TidyRequest) -> Result<TidyStatus> {
        let mut status = self
            .tidy
            .run(request, &self.config.tidy, &self.rebuilder, &self.shutdown)
            .await?;

        if request.tidy_acme && !self.shutdown.is_cancelled() {
            let acme = self
                .acme
                .tidy(self.config.tidy.acme_safety_buffer, Utc::now())
                .await?;
            status.acme_orders_deleted = acme.orders_deleted;
            status.acme_nonces_deleted = acme.nonces_deleted;
        }

        if status.crl_rebuild_requested && !self.crl_config().auto_rebuild {
            self.rebuilder.rebuild_if_forced(&self.crl_config()).await?;
        }
        Ok(status)
    }

    /// ACME revoke-cert: authorize, then revoke through the normal path.
    pub async fn acme_revoke(&self, jws: &crate::acme::JwsRequest) -> Result<RevocationOutcome> {
        let authorized = self.acme.authorize_revocation(jws).await?;
        let outcome = self.revoke_serial(&authorized.serial_number).await?;
        if !outcome.newly_revoked && !outcome.expired {
            return Err(PkiError::acme(
                AcmeErrorKind::AlreadyRevoked,
                format!("certificate {} is already revoked", outcome.serial_number),
            ));
        }
        Ok(outcome)
    }
}

#[async_trait]
impl PeriodicTask for PkiBackend {
    fn name(&self) -> &'static str {
        "pki-periodic"
    }

    async fn tick(&self) {
        let config = self.crl_config();
        // Failures are logged inside the rebuilder.
        let _ = self.rebuilder.periodic_tick(&config).await;

        if let Some(swept) = self.acme.nonces().maybe_tidy_at(Utc::now()) {
            debug!("Swept {} expired ACME nonces", swept);
        }
    }
}
