use thiserror::Error;

pub type Result<T> = std::result::Result<T, PkiError>;

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] der::Error),

    #[error("Invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("CRL build failed: {0}")]
    CrlBuild(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("ACME {kind:?}: {detail}")]
    Acme { kind: AcmeErrorKind, detail: String },
}

impl PkiError {
    pub fn acme(kind: AcmeErrorKind, detail: impl Into<String>) -> Self {
        PkiError::Acme {
            kind,
            detail: detail.into(),
        }
    }

    /// Errors caused by the caller's input. These are reported back and never
    /// logged as system failures.
    pub fn is_user_error(&self) -> bool {
        match self {
            PkiError::InvalidRequest(_) | PkiError::InvalidConfig(_) | PkiError::NotFound(_) => true,
            PkiError::Acme { kind, .. } => *kind != AcmeErrorKind::ServerInternal,
            _ => false,
        }
    }

    /// The ACME sentinel for this error. Anything that is not already an ACME
    /// error maps to `ServerInternal`, except typed not-found which the ACME
    /// layer reports as malformed.
    pub fn acme_kind(&self) -> AcmeErrorKind {
        match self {
            PkiError::Acme { kind, .. } => *kind,
            PkiError::InvalidRequest(_) | PkiError::NotFound(_) => AcmeErrorKind::Malformed,
            _ => AcmeErrorKind::ServerInternal,
        }
    }
}

/// Fixed set of ACME error kinds the HTTP boundary maps to RFC 8555
/// problem documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmeErrorKind {
    Malformed,
    BadCsr,
    BadNonce,
    BadSignature,
    BadSignatureAlgorithm,
    OrderNotReady,
    UnsupportedIdentifier,
    ServerInternal,
    AccountDoesNotExist,
    Unauthorized,
    AlreadyRevoked,
    InvalidContact,
}

impl AcmeErrorKind {
    pub fn problem_type(self) -> &'static str {
        match self {
            AcmeErrorKind::Malformed => "urn:ietf:params:acme:error:malformed",
            AcmeErrorKind::BadCsr => "urn:ietf:params:acme:error:badCSR",
            AcmeErrorKind::BadNonce => "urn:ietf:params:acme:error:badNonce",
            AcmeErrorKind::BadSignature => "urn:ietf:params:acme:error:badSignature",
            AcmeErrorKind::BadSignatureAlgorithm => {
                "urn:ietf:params:acme:error:badSignatureAlgorithm"
            }
            AcmeErrorKind::OrderNotReady => "urn:ietf:params:acme:error:orderNotReady",
            AcmeErrorKind::UnsupportedIdentifier => {
                "urn:ietf:params:acme:error:unsupportedIdentifier"
            }
            AcmeErrorKind::ServerInternal => "urn:ietf:params:acme:error:serverInternal",
            AcmeErrorKind::AccountDoesNotExist => "urn:ietf:params:acme:error:accountDoesNotExist",
            AcmeErrorKind::Unauthorized => "urn:ietf:params:acme:error:unauthorized",
            AcmeErrorKind::AlreadyRevoked => "urn:ietf:params:acme:error:alreadyRevoked",
            AcmeErrorKind::InvalidContact => "urn:ietf:params:acme:error:invalidContact",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            AcmeErrorKind::ServerInternal => 500,
            AcmeErrorKind::Unauthorized => 403,
            AcmeErrorKind::OrderNotReady => 403,
            _ => 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acme_kind_mapping_is_deterministic() {
        assert_eq!(
            AcmeErrorKind::BadNonce.problem_type(),
            "urn:ietf:params:acme:error:badNonce"
        );
        assert_eq!(AcmeErrorKind::ServerInternal.http_status(), 500);
        assert_eq!(AcmeErrorKind::OrderNotReady.http_status(), 403);
        assert_eq!(AcmeErrorKind::BadCsr.http_status(), 400);
    }

    #[test]
    fn test_user_error_classification() {
        assert!(PkiError::InvalidRequest("bad ttl".to_string()).is_user_error());
        assert!(PkiError::acme(AcmeErrorKind::BadCsr, "mismatch").is_user_error());
        assert!(!PkiError::Storage("disk full".to_string()).is_user_error());
        assert!(!PkiError::acme(AcmeErrorKind::ServerInternal, "boom").is_user_error());
    }

    #[test]
    fn test_non_acme_errors_map_to_server_internal() {
        let err = PkiError::Storage("unreachable".to_string());
        assert_eq!(err.acme_kind(), AcmeErrorKind::ServerInternal);
        let err = PkiError::NotFound("order".to_string());
        assert_eq!(err.acme_kind(), AcmeErrorKind::Malformed);
    }
}
