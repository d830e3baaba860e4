use crate::api::guarded;
use crate::backend::PkiBackend;
use crate::error::{PkiError, Result};
use crate::pki::{
    GenerateRootRequest, ImportResponse, IntermediateCsrRequest, IntermediateCsrResponse,
    IssueRequest, IssuedCertificate, IssuerResponse, RevocationOutcome, TidyRequest, TidyStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Exactly one of `serial_number` or `certificate` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevokeRequest {
    #[serde(default)]
    pub serial_number: Option<String>,
    /// PEM certificate, for certificates this mount did not store.
    #[serde(default)]
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteIssuerResponse {
    pub issuer_id: String,
    pub issuer_name: String,
}

/// Issuer lifecycle, issuance, revocation and tidy.
pub struct IssuerHandlers {
    backend: Arc<PkiBackend>,
}

impl IssuerHandlers {
    pub fn new(backend: Arc<PkiBackend>) -> Self {
        Self { backend }
    }

    /// `POST /root/generate/internal`
    pub async fn generate_root(&self, request: GenerateRootRequest) -> Result<IssuerResponse> {
        guarded("root/generate", self.backend.ca().generate_root(request)).await
    }

    /// `POST /intermediate/generate/internal`
    pub async fn generate_intermediate(
        &self,
        request: IntermediateCsrRequest,
    ) -> Result<IntermediateCsrResponse> {
        guarded(
            "intermediate/generate",
            self.backend.ca().generate_intermediate_csr(request),
        )
        .await
    }

    /// `POST /issuer/<ref>/sign-intermediate`
    pub async fn sign_intermediate(
        &self,
        issuer_ref: &str,
        csr_pem: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedCertificate> {
        guarded(
            "issuer/sign-intermediate",
            self.backend.ca().sign_intermediate(issuer_ref, csr_pem, ttl),
        )
        .await
    }

    /// `POST /issuers/import/bundle`
    pub async fn import(&self, pem_bundle: &str) -> Result<ImportResponse> {
        guarded("issuers/import", async {
            let response = self.backend.ca().import_bundle(pem_bundle).await?;
            if !response.imported_issuers.is_empty() {
                self.backend.rebuilder().request_rebuild();
            }
            Ok(response)
        })
        .await
    }

    /// `POST /issue`
    pub async fn issue(&self, request: IssueRequest) -> Result<IssuedCertificate> {
        guarded("issue", self.backend.ca().issue_leaf(request)).await
    }

    /// `POST /revoke`
    pub async fn revoke(&self, request: RevokeRequest) -> Result<RevocationOutcome> {
        guarded("revoke", async {
            let outcome = match (&request.serial_number, &request.certificate) {
                (Some(serial), None) => self.backend.revoke_serial(serial).await?,
                (None, Some(pem)) => self.backend.revoke_certificate(pem).await?,
                _ => {
                    return Err(PkiError::InvalidRequest(
                        "exactly one of serial_number or certificate is required".to_string(),
                    ))
                }
            };
            if outcome.newly_revoked {
                info!(serial = %outcome.serial_number, "Certificate revoked");
            }
            Ok(outcome)
        })
        .await
    }

    /// `DELETE /issuer/<ref>`
    pub async fn delete_issuer(&self, issuer_ref: &str) -> Result<DeleteIssuerResponse> {
        guarded("issuer/delete", async {
            let deleted = self.backend.delete_issuer(issuer_ref).await?;
            Ok(DeleteIssuerResponse {
                issuer_id: deleted.id,
                issuer_name: deleted.name,
            })
        })
        .await
    }

    /// `POST /tidy`
    pub async fn tidy(&self, request: TidyRequest) -> Result<TidyStatus> {
        guarded("tidy", self.backend.tidy(&request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::{MemoryStorage, Storage};

    async fn handlers() -> IssuerHandlers {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let backend = PkiBackend::setup(storage, EngineConfig::default()).await.unwrap();
        IssuerHandlers::new(backend)
    }

    #[tokio::test]
    async fn test_revoke_requires_exactly_one_selector() {
        let handlers = handlers().await;
        let err = handlers.revoke(RevokeRequest::default()).await.unwrap_err();
        assert!(matches!(err, PkiError::InvalidRequest(_)));

        let err = handlers
            .revoke(RevokeRequest {
                serial_number: Some("01".to_string()),
                certificate: Some("pem".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PkiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_issue_and_revoke_twice() {
        let handlers = handlers().await;
        handlers
            .generate_root(GenerateRootRequest {
                common_name: "Issuer Handler Root".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let leaf = handlers
            .issue(IssueRequest {
                common_name: "svc.example.com".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let request = RevokeRequest {
            serial_number: Some(leaf.serial_number.clone()),
            certificate: None,
        };
        let first = handlers.revoke(request.clone()).await.unwrap();
        assert!(first.newly_revoked);
        let second = handlers.revoke(request).await.unwrap();
        assert!(!second.newly_revoked);
        assert_eq!(second.revocation_time, first.revocation_time);
    }

    #[tokio::test]
    async fn test_delete_unknown_issuer_is_not_found() {
        let handlers = handlers().await;
        let err = handlers.delete_issuer("missing").await.unwrap_err();
        assert!(matches!(err, PkiError::NotFound(_)));
    }
}
