use crate::error::{PkiError, Result};
use const_oid::ObjectIdentifier;
use rcgen::KeyPair;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, RsaKeyPair};
use serde::{Deserialize, Serialize};
use spki::AlgorithmIdentifierOwned;

pub const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
pub const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
pub const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// Key algorithms the engine can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    #[default]
    EcP256,
    EcP384,
    Ed25519,
}

impl KeyType {
    pub fn algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            KeyType::EcP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyType::EcP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyType::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

pub fn generate_key_pair(key_type: KeyType) -> Result<KeyPair> {
    KeyPair::generate(key_type.algorithm()).map_err(|e| {
        PkiError::Signing(format!("Failed to generate {:?} key pair: {}", key_type, e))
    })
}

pub fn load_key_pair(private_key_pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(private_key_pem).map_err(|e| PkiError::InvalidCertificate {
        reason: format!("Failed to parse private key: {}", e),
    })
}

enum SigningKey {
    EcdsaP256(EcdsaKeyPair),
    EcdsaP384(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
    Rsa(RsaKeyPair),
}

/// Raw signer over a stored issuer key, used for structures rcgen cannot
/// produce itself (revocation lists).
pub struct RawSigner {
    key: SigningKey,
    rng: SystemRandom,
}

impl RawSigner {
    pub fn from_pem(private_key_pem: &str) -> Result<Self> {
        let key_pair = load_key_pair(private_key_pem)?;
        Self::from_key_pair(&key_pair)
    }

    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self> {
        let pkcs8 = key_pair.serialize_der();
        let alg = key_pair.algorithm();
        let rejected = |e: ring::error::KeyRejected| {
            PkiError::Signing(format!("issuer key rejected: {}", e))
        };

        let key = if alg == &rcgen::PKCS_ECDSA_P256_SHA256 {
            SigningKey::EcdsaP256(
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8)
                    .map_err(rejected)?,
            )
        } else if alg == &rcgen::PKCS_ECDSA_P384_SHA384 {
            SigningKey::EcdsaP384(
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, &pkcs8)
                    .map_err(rejected)?,
            )
        } else if alg == &rcgen::PKCS_ED25519 {
            SigningKey::Ed25519(Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8).map_err(rejected)?)
        } else if alg == &rcgen::PKCS_RSA_SHA256 {
            SigningKey::Rsa(RsaKeyPair::from_pkcs8(&pkcs8).map_err(rejected)?)
        } else {
            return Err(PkiError::Signing(
                "unsupported issuer key algorithm".to_string(),
            ));
        };

        Ok(Self {
            key,
            rng: SystemRandom::new(),
        })
    }

    pub fn algorithm_identifier(&self) -> Result<AlgorithmIdentifierOwned> {
        let (oid, parameters) = match self.key {
            SigningKey::EcdsaP256(_) => (ECDSA_WITH_SHA256, None),
            SigningKey::EcdsaP384(_) => (ECDSA_WITH_SHA384, None),
            SigningKey::Ed25519(_) => (ED25519, None),
            SigningKey::Rsa(_) => (
                SHA256_WITH_RSA,
                Some(der::Any::new(der::Tag::Null, Vec::<u8>::new())?),
            ),
        };
        Ok(AlgorithmIdentifierOwned { oid, parameters })
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let failed = |_| PkiError::Signing("signature operation failed".to_string());
        match &self.key {
            SigningKey::EcdsaP256(key) | SigningKey::EcdsaP384(key) => {
                let sig = key.sign(&self.rng, message).map_err(failed)?;
                Ok(sig.as_ref().to_vec())
            }
            SigningKey::Ed25519(key) => Ok(key.sign(message).as_ref().to_vec()),
            SigningKey::Rsa(key) => {
                let mut sig = vec![0u8; key.public_modulus_len()];
                key.sign(&signature::RSA_PKCS1_SHA256, &self.rng, message, &mut sig)
                    .map_err(failed)?;
                Ok(sig)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::UnparsedPublicKey;

    #[test]
    fn test_raw_signer_ecdsa_verifies() {
        let key_pair = generate_key_pair(KeyType::EcP256).unwrap();
        let signer = RawSigner::from_key_pair(&key_pair).unwrap();
        let sig = signer.sign(b"tbs").unwrap();

        let public = UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, key_pair.public_key_raw());
        assert!(public.verify(b"tbs", &sig).is_ok());
        assert_eq!(signer.algorithm_identifier().unwrap().oid, ECDSA_WITH_SHA256);
    }

    #[test]
    fn test_raw_signer_ed25519_from_pem() {
        let key_pair = generate_key_pair(KeyType::Ed25519).unwrap();
        let signer = RawSigner::from_pem(&key_pair.serialize_pem()).unwrap();
        let sig = signer.sign(b"tbs").unwrap();

        let public = UnparsedPublicKey::new(&signature::ED25519, key_pair.public_key_raw());
        assert!(public.verify(b"tbs", &sig).is_ok());
    }

    #[test]
    fn test_load_key_pair_rejects_garbage() {
        assert!(load_key_pair("not a key").is_err());
    }
}
