use crate::acme::identifier::AcmeIdentifier;
use crate::acme::jws::encode_b64;
use crate::acme::order::ChallengeType;
use crate::error::{AcmeErrorKind, PkiError, Result};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

pub fn new_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut raw);
    encode_b64(&raw)
}

/// `token.thumbprint` (RFC 8555 section 8.1).
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// TXT record value expected under `_acme-challenge` for dns-01.
pub fn dns01_txt_value(key_authorization: &str) -> String {
    encode_b64(&Sha256::digest(key_authorization.as_bytes()))
}

/// Performs the network side of a challenge. Returns an ACME error whose
/// kind becomes the challenge's recorded problem type on failure.
#[async_trait]
pub trait ChallengeValidator: Send + Sync {
    async fn validate(
        &self,
        kind: ChallengeType,
        identifier: &AcmeIdentifier,
        token: &str,
        key_authorization: &str,
    ) -> Result<()>;
}

/// Used when the host has not supplied a validator: every challenge fails.
pub struct RejectingValidator;

#[async_trait]
impl ChallengeValidator for RejectingValidator {
    async fn validate(
        &self,
        kind: ChallengeType,
        identifier: &AcmeIdentifier,
        _token: &str,
        _key_authorization: &str,
    ) -> Result<()> {
        Err(PkiError::acme(
            AcmeErrorKind::Unauthorized,
            format!(
                "no {} validator is configured for {}",
                kind.as_str(),
                identifier.value
            ),
        ))
    }
}
