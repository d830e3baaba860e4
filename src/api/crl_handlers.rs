use crate::api::guarded;
use crate::backend::PkiBackend;
use crate::config::{CrlConfig, CrlConfigUpdate};
use crate::error::{PkiError, Result};
use crate::pki::crl::{crl_to_pem, BuiltCrl, CrlKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrlFormat {
    #[default]
    Der,
    Pem,
}

/// A CRL as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrlBody {
    Der(Vec<u8>),
    Pem(String),
}

impl CrlBody {
    fn encode(der: Vec<u8>, format: CrlFormat) -> Self {
        match format {
            CrlFormat::Der => CrlBody::Der(der),
            CrlFormat::Pem => CrlBody::Pem(crl_to_pem(&der)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateResponse {
    pub success: bool,
    pub complete: Vec<BuiltCrl>,
    pub delta: Vec<BuiltCrl>,
    pub warnings: Vec<String>,
}

/// CRL rotation, retrieval and `config/crl`.
pub struct CrlHandlers {
    backend: Arc<PkiBackend>,
}

impl CrlHandlers {
    pub fn new(backend: Arc<PkiBackend>) -> Self {
        Self { backend }
    }

    /// `POST /crl/rotate`
    pub async fn rotate(&self) -> Result<RotateResponse> {
        guarded("crl/rotate", async {
            let report = self.backend.rotate_crl().await?;
            info!(crls = report.complete.len(), "CRLs rotated");
            Ok(RotateResponse {
                success: true,
                warnings: report
                    .omitted_serials
                    .iter()
                    .map(|serial| format!("revoked certificate {} has no known issuer", serial))
                    .collect(),
                complete: report.complete,
                delta: report.delta,
            })
        })
        .await
    }

    /// `POST /crl/rotate-delta`
    pub async fn rotate_delta(&self) -> Result<RotateResponse> {
        guarded("crl/rotate-delta", async {
            let report = self.backend.rotate_delta_crl().await?;
            Ok(RotateResponse {
                success: true,
                complete: report.complete,
                delta: report.delta,
                warnings: vec![],
            })
        })
        .await
    }

    /// `GET /crl`
    pub async fn read_crl(&self, format: CrlFormat) -> Result<CrlBody> {
        guarded("crl", async {
            let der = self
                .backend
                .default_crl(CrlKind::Complete)
                .await?
                .ok_or_else(|| PkiError::NotFound("no CRL has been built yet".to_string()))?;
            Ok(CrlBody::encode(der, format))
        })
        .await
    }

    /// `GET /crl/delta`
    pub async fn read_delta_crl(&self, format: CrlFormat) -> Result<CrlBody> {
        guarded("crl/delta", async {
            let der = self
                .backend
                .default_crl(CrlKind::Delta)
                .await?
                .ok_or_else(|| PkiError::NotFound("no delta CRL has been built".to_string()))?;
            Ok(CrlBody::encode(der, format))
        })
        .await
    }

    /// `GET /issuer/<ref>/crl[/delta][/der|/pem]`
    pub async fn read_issuer_crl(
        &self,
        issuer_ref: &str,
        kind: CrlKind,
        format: CrlFormat,
    ) -> Result<CrlBody> {
        guarded("issuer/crl", async {
            let der = self
                .backend
                .issuer_crl(issuer_ref, kind)
                .await?
                .ok_or_else(|| PkiError::NotFound(format!("no CRL for issuer {}", issuer_ref)))?;
            Ok(CrlBody::encode(der, format))
        })
        .await
    }

    /// `GET /config/crl`
    pub async fn read_config(&self) -> Result<CrlConfig> {
        Ok(self.backend.crl_config())
    }

    /// `POST /config/crl`
    pub async fn write_config(&self, update: CrlConfigUpdate) -> Result<CrlConfig> {
        guarded("config/crl", self.backend.update_crl_config(&update)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pki::GenerateRootRequest;
    use crate::storage::{MemoryStorage, Storage};

    async fn handlers() -> CrlHandlers {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let backend = PkiBackend::setup(storage, EngineConfig::default()).await.unwrap();
        backend
            .ca()
            .generate_root(GenerateRootRequest {
                common_name: "Handler Root".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        CrlHandlers::new(backend)
    }

    #[tokio::test]
    async fn test_read_before_rotate_is_not_found() {
        let handlers = handlers().await;
        assert!(matches!(
            handlers.read_crl(CrlFormat::Der).await,
            Err(PkiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rotate_then_read_pem() {
        let handlers = handlers().await;
        let rotated = handlers.rotate().await.unwrap();
        assert_eq!(rotated.complete.len(), 1);

        match handlers.read_crl(CrlFormat::Pem).await.unwrap() {
            CrlBody::Pem(pem) => assert!(pem.starts_with("-----BEGIN X509 CRL-----")),
            other => panic!("expected PEM, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_config_rejects_bad_durations() {
        let handlers = handlers().await;
        let err = handlers
            .write_config(CrlConfigUpdate {
                delta_rebuild_interval: Some("soon".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PkiError::InvalidRequest(_)));

        let updated = handlers
            .write_config(CrlConfigUpdate {
                auto_rebuild: Some(true),
                enable_delta: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(updated.delta_active());
        assert_eq!(handlers.read_config().await.unwrap(), updated);
    }
}
