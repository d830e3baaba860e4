use crate::config::CrlConfig;
use crate::error::{PkiError, Result};
use crate::pki::ca::chrono_duration;
use crate::pki::crl::builder::{CrlBuildReport, CrlBuilder, CrlId};
use crate::pki::revocation::RevocationStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug)]
pub enum RebuildOutcome {
    Built(CrlBuildReport),
    /// Nothing was pending.
    NotNeeded,
    /// Another rebuild holds the operation lock.
    InFlight,
}

impl RebuildOutcome {
    pub fn was_built(&self) -> bool {
        matches!(self, RebuildOutcome::Built(_))
    }
}

#[derive(Debug, Default)]
struct RebuilderState {
    forced: bool,
    delta_requested: bool,
    last_built: HashMap<CrlId, DateTime<Utc>>,
    last_delta_built: Option<DateTime<Utc>>,
}

/// Decides when CRLs are rebuilt. Owned by one backend instance.
pub struct CrlRebuilder {
    builder: CrlBuilder,
    revocations: Arc<RevocationStore>,
    state: Mutex<RebuilderState>,
    op_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl CrlRebuilder {
    pub fn new(
        builder: CrlBuilder,
        revocations: Arc<RevocationStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            builder,
            revocations,
            state: Mutex::new(RebuilderState::default()),
            op_lock: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    pub fn builder(&self) -> &CrlBuilder {
        &self.builder
    }

    /// Marks a full rebuild as pending for the next opportunity.
    pub fn request_rebuild(&self) {
        self.state.lock().forced = true;
        debug!("Full CRL rebuild requested");
    }

    pub fn request_delta_rebuild(&self) {
        self.state.lock().delta_requested = true;
        debug!("Delta CRL rebuild requested");
    }

    pub fn is_rebuild_pending(&self) -> bool {
        self.state.lock().forced
    }

    pub fn last_built(&self) -> HashMap<CrlId, DateTime<Utc>> {
        self.state.lock().last_built.clone()
    }

    /// Full rebuild, waiting for any in-flight rebuild first. Without `force`
    /// it only builds when a rebuild was requested.
    pub async fn rebuild(&self, config: &CrlConfig, force: bool) -> Result<RebuildOutcome> {
        let _guard = self.op_lock.lock().await;
        if !force && !self.is_rebuild_pending() {
            return Ok(RebuildOutcome::NotNeeded);
        }
        self.run_full(config).await
    }

    /// Fast path used on every tick and after revocations: returns at once
    /// when nothing is pending or another caller is already rebuilding.
    pub async fn rebuild_if_forced(&self, config: &CrlConfig) -> Result<RebuildOutcome> {
        if !self.is_rebuild_pending() {
            return Ok(RebuildOutcome::NotNeeded);
        }
        let Ok(_guard) = self.op_lock.try_lock() else {
            debug!("CRL rebuild already in flight");
            return Ok(RebuildOutcome::InFlight);
        };
        if !self.is_rebuild_pending() {
            return Ok(RebuildOutcome::NotNeeded);
        }
        self.run_full(config).await
    }

    async fn run_full(&self, config: &CrlConfig) -> Result<RebuildOutcome> {
        self.state.lock().forced = false;

        match self.builder.build_complete(config, &self.shutdown).await {
            Ok(report) => {
                let mut state = self.state.lock();
                for crl in &report.complete {
                    state.last_built.insert(crl.crl_id.clone(), crl.this_update);
                }
                if !report.delta.is_empty() {
                    state.last_delta_built = report.delta.iter().map(|d| d.this_update).max();
                    state.delta_requested = false;
                }
                Ok(RebuildOutcome::Built(report))
            }
            Err(e) => {
                self.state.lock().forced = true;
                Err(e)
            }
        }
    }

    /// Requests a full rebuild when any stored CRL is inside its grace
    /// period before nextUpdate.
    pub async fn check_for_auto_rebuild(&self, config: &CrlConfig) -> Result<bool> {
        if !config.auto_rebuild {
            return Ok(false);
        }

        let now = Utc::now();
        let grace = chrono_duration(config.auto_rebuild_grace_period)?;
        for (crl_id, summary) in self.builder.stored_complete_crls().await? {
            let Some(next_update) = summary.next_update else {
                continue;
            };
            if now >= next_update - grace {
                info!(
                    "CRL {} is within its grace period (nextUpdate {}); scheduling rebuild",
                    crl_id, next_update
                );
                self.request_rebuild();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Builds delta CRLs when delta lists are on, the rebuild interval has
    /// elapsed, revocations are waiting and no full rebuild is pending.
    pub async fn rebuild_delta_if_due(&self, config: &CrlConfig) -> Result<RebuildOutcome> {
        if !config.delta_active() || self.is_rebuild_pending() {
            return Ok(RebuildOutcome::NotNeeded);
        }

        let now = Utc::now();
        let interval = chrono_duration(config.delta_rebuild_interval)?;
        let (requested, last) = {
            let state = self.state.lock();
            (state.delta_requested, state.last_delta_built)
        };
        if let Some(last) = last {
            if now < last + interval {
                return Ok(RebuildOutcome::NotNeeded);
            }
        }
        if !requested && !self.revocations.delta_pending().await? {
            return Ok(RebuildOutcome::NotNeeded);
        }

        let Ok(_guard) = self.op_lock.try_lock() else {
            return Ok(RebuildOutcome::InFlight);
        };
        self.run_delta(config).await
    }

    /// Delta rebuild on explicit request, ignoring the interval.
    pub async fn rebuild_delta(&self, config: &CrlConfig) -> Result<RebuildOutcome> {
        if !config.delta_active() {
            return Err(PkiError::InvalidRequest(
                "delta CRLs are not enabled".to_string(),
            ));
        }
        let _guard = self.op_lock.lock().await;
        self.run_delta(config).await
    }

    async fn run_delta(&self, config: &CrlConfig) -> Result<RebuildOutcome> {
        let report = self.builder.build_delta(config, &self.shutdown).await?;
        let mut state = self.state.lock();
        state.delta_requested = false;
        state.last_delta_built = Some(Utc::now());
        Ok(RebuildOutcome::Built(report))
    }

    /// One scheduler tick. Failures are logged and left for the next tick.
    pub async fn periodic_tick(&self, config: &CrlConfig) -> Result<()> {
        if let Err(e) = self.check_for_auto_rebuild(config).await {
            error!("CRL auto-rebuild check failed: {}", e);
        }

        if let Err(e) = self.rebuild_if_forced(config).await {
            error!("Scheduled CRL rebuild failed; will retry next tick: {}", e);
            return Err(e);
        }

        if let Err(e) = self.rebuild_delta_if_due(config).await {
            error!("Scheduled delta CRL rebuild failed; will retry next tick: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Restores `last_built` from the stored CRLs after a restart.
    pub async fn reload_from_storage(&self) -> Result<()> {
        let stored = self.builder.stored_complete_crls().await?;
        let local = self.builder.local_config().await?;

        let mut state = self.state.lock();
        state.last_built = stored
            .into_iter()
            .map(|(crl_id, summary)| (crl_id, summary.this_update))
            .collect();
        state.last_delta_built = local.delta_last_modified;
        info!("Rebuilder state reloaded for {} CRLs", state.last_built.len());
        Ok(())
    }
}
