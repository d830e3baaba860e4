use crate::acme::JwsRequest;
use crate::api::guarded;
use crate::backend::PkiBackend;
use crate::error::{AcmeErrorKind, PkiError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const PEM_CHAIN_CONTENT_TYPE: &str = "application/pem-certificate-chain";

/// RFC 7807 problem document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    pub status: u16,
}

impl Problem {
    pub fn from_error(err: &PkiError) -> Self {
        let kind = err.acme_kind();
        let detail = match err {
            PkiError::Acme { detail, .. } => detail.clone(),
            other if kind == AcmeErrorKind::ServerInternal => {
                debug!("Hiding internal error detail from client: {}", other);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            problem_type: kind.problem_type().to_string(),
            detail,
            status: kind.http_status(),
        }
    }
}

/// Everything the host needs to write an ACME HTTP response.
#[derive(Debug, Clone)]
pub struct AcmeReply {
    pub status: u16,
    pub content_type: &'static str,
    pub location: Option<String>,
    /// Fresh nonce for the `Replay-Nonce` header.
    pub replay_nonce: Option<String>,
    pub body: Vec<u8>,
}

impl AcmeReply {
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn problem(&self) -> Option<Problem> {
        if self.content_type == PROBLEM_CONTENT_TYPE {
            serde_json::from_slice(&self.body).ok()
        } else {
            None
        }
    }
}

struct Success {
    status: u16,
    content_type: &'static str,
    location: Option<String>,
    body: Vec<u8>,
}

impl Success {
    fn json<T: Serialize>(status: u16, location: Option<String>, body: &T) -> Result<Self> {
        Ok(Self {
            status,
            content_type: JSON_CONTENT_TYPE,
            location,
            body: serde_json::to_vec(body)?,
        })
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: JSON_CONTENT_TYPE,
            location: None,
            body: Vec::new(),
        }
    }
}

/// The `/acme/*` endpoints. Request bodies are flattened JWS documents.
pub struct AcmeHandlers {
    backend: Arc<PkiBackend>,
}

impl AcmeHandlers {
    pub fn new(backend: Arc<PkiBackend>) -> Self {
        Self { backend }
    }

    fn parse(body: &[u8]) -> Result<JwsRequest> {
        serde_json::from_slice(body).map_err(|e| {
            PkiError::acme(
                AcmeErrorKind::Malformed,
                format!("request body is not a flattened JWS: {}", e),
            )
        })
    }

    async fn respond<F>(&self, operation: &'static str, future: F) -> AcmeReply
    where
        F: Future<Output = Result<Success>>,
    {
        let result = if self.backend.config().acme.enabled {
            guarded(operation, future).await
        } else {
            Err(PkiError::acme(
                AcmeErrorKind::Unauthorized,
                "ACME is disabled on this mount",
            ))
        };
        let replay_nonce = Some(self.backend.acme().new_nonce());

        match result {
            Ok(success) => AcmeReply {
                status: success.status,
                content_type: success.content_type,
                location: success.location,
                replay_nonce,
                body: success.body,
            },
            Err(e) => {
                if e.is_user_error() {
                    debug!(operation, "ACME request rejected: {}", e);
                } else {
                    error!(operation, "ACME request failed: {}", e);
                }
                let problem = Problem::from_error(&e);
                AcmeReply {
                    status: problem.status,
                    content_type: PROBLEM_CONTENT_TYPE,
                    location: None,
                    replay_nonce,
                    body: serde_json::to_vec(&problem).unwrap_or_default(),
                }
            }
        }
    }

    /// `GET /acme/directory`
    pub async fn directory(&self) -> AcmeReply {
        self.respond("acme/directory", async {
            Success::json(200, None, &self.backend.acme().directory())
        })
        .await
    }

    /// `HEAD|GET /acme/new-nonce`. The nonce travels in `replay_nonce`.
    pub async fn new_nonce(&self, head: bool) -> AcmeReply {
        let status = if head { 200 } else { 204 };
        self.respond("acme/new-nonce", async move { Ok(Success::empty(status)) })
            .await
    }

    /// `POST /acme/new-account`
    pub async fn new_account(&self, body: &[u8]) -> AcmeReply {
        self.respond("acme/new-account", async {
            let jws = Self::parse(body)?;
            let outcome = self.backend.acme().new_account(&jws).await?;
            let status = if outcome.created { 201 } else { 200 };
            Success::json(status, Some(outcome.location), &outcome.account)
        })
        .await
    }

    /// `POST /acme/account/<id>`
    pub async fn account(&self, account_id: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/account", async {
            let jws = Self::parse(body)?;
            let outcome = self.backend.acme().update_account(&jws, account_id).await?;
            Success::json(200, Some(outcome.location), &outcome.account)
        })
        .await
    }

    /// `POST /acme/key-change`
    pub async fn key_change(&self, body: &[u8]) -> AcmeReply {
        self.respond("acme/key-change", async {
            let jws = Self::parse(body)?;
            let outcome = self.backend.acme().key_change(&jws).await?;
            Success::json(200, Some(outcome.location), &outcome.account)
        })
        .await
    }

    /// `POST /acme/new-order`
    pub async fn new_order(&self, body: &[u8]) -> AcmeReply {
        self.respond("acme/new-order", async {
            let jws = Self::parse(body)?;
            let outcome = self.backend.acme().new_order(&jws).await?;
            Success::json(201, Some(outcome.location), &outcome.order)
        })
        .await
    }

    /// `POST /acme/order/<id>`
    pub async fn order(&self, order_id: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/order", async {
            let jws = Self::parse(body)?;
            let outcome = self.backend.acme().get_order(&jws, order_id).await?;
            Success::json(200, Some(outcome.location), &outcome.order)
        })
        .await
    }

    /// `POST /acme/account/<id>/orders`
    pub async fn orders(&self, account_id: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/orders", async {
            let jws = Self::parse(body)?;
            let listing = self.backend.acme().list_orders(&jws, account_id).await?;
            Success::json(200, None, &listing)
        })
        .await
    }

    /// `POST /acme/authorization/<id>`
    pub async fn authorization(&self, authz_id: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/authorization", async {
            let jws = Self::parse(body)?;
            let authz = self.backend.acme().get_authorization(&jws, authz_id).await?;
            Success::json(200, None, &authz)
        })
        .await
    }

    /// `POST /acme/challenge/<authz>/<type>`
    pub async fn challenge(&self, authz_id: &str, challenge_type: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/challenge", async {
            let jws = Self::parse(body)?;
            let challenge = self
                .backend
                .acme()
                .respond_challenge(&jws, authz_id, challenge_type)
                .await?;
            Success::json(200, None, &challenge)
        })
        .await
    }

    /// `POST /acme/order/<id>/finalize`
    pub async fn finalize(&self, order_id: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/finalize", async {
            let jws = Self::parse(body)?;
            let outcome = self.backend.acme().finalize_order(&jws, order_id).await?;
            Success::json(200, Some(outcome.location), &outcome.order)
        })
        .await
    }

    /// `POST /acme/order/<id>/cert`
    pub async fn certificate(&self, order_id: &str, body: &[u8]) -> AcmeReply {
        self.respond("acme/cert", async {
            let jws = Self::parse(body)?;
            let chain = self.backend.acme().fetch_certificate(&jws, order_id).await?;
            Ok(Success {
                status: 200,
                content_type: PEM_CHAIN_CONTENT_TYPE,
                location: None,
                body: chain.into_bytes(),
            })
        })
        .await
    }

    /// `POST /acme/revoke-cert`
    pub async fn revoke_cert(&self, body: &[u8]) -> AcmeReply {
        self.respond("acme/revoke-cert", async {
            let jws = Self::parse(body)?;
            self.backend.acme_revoke(&jws).await?;
            Ok(Success::empty(200))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::{MemoryStorage, Storage};

    async fn handlers(config: EngineConfig) -> AcmeHandlers {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        AcmeHandlers::new(PkiBackend::setup(storage, config).await.unwrap())
    }

    #[tokio::test]
    async fn test_every_reply_carries_a_fresh_nonce() {
        let handlers = handlers(EngineConfig::default()).await;
        let first = handlers.new_nonce(true).await;
        let second = handlers.new_nonce(false).await;
        assert_eq!(first.status, 200);
        assert_eq!(second.status, 204);
        assert!(first.replay_nonce.is_some());
        assert_ne!(first.replay_nonce, second.replay_nonce);
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed_problem() {
        let handlers = handlers(EngineConfig::default()).await;
        let reply = handlers.new_account(b"not json").await;
        assert_eq!(reply.status, 400);
        let problem = reply.problem().unwrap();
        assert_eq!(problem.problem_type, "urn:ietf:params:acme:error:malformed");
        assert!(reply.replay_nonce.is_some());
    }

    #[tokio::test]
    async fn test_directory_lists_endpoints() {
        let handlers = handlers(EngineConfig::default()).await;
        let reply = handlers.directory().await;
        let directory: serde_json::Value = reply.json_body().unwrap();
        assert_eq!(
            directory["newNonce"],
            "https://localhost:8200/v1/pki/acme/new-nonce"
        );
        assert!(directory["meta"].is_object());
    }

    #[tokio::test]
    async fn test_disabled_acme_rejects_requests() {
        let mut config = EngineConfig::default();
        config.acme.enabled = false;
        let handlers = handlers(config).await;
        let reply = handlers.directory().await;
        assert_eq!(reply.status, 403);
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let problem = Problem::from_error(&PkiError::Storage("disk path /var/x".to_string()));
        assert_eq!(problem.status, 500);
        assert_eq!(problem.detail, "internal server error");
    }
}
