//! Flattened JWS envelopes (RFC 7515) as used by RFC 8555 requests.

use crate::error::{AcmeErrorKind, PkiError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::signature::{
    RsaPublicKeyComponents, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED, ECDSA_P384_SHA384_FIXED,
    ED25519, RSA_PKCS1_2048_8192_SHA256,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsRequest {
    pub protected: String,
    #[serde(default)]
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default)]
    pub nonce: Option<String>,
    pub url: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub jwk: Option<Value>,
}

impl JwsRequest {
    pub fn header(&self) -> Result<ProtectedHeader> {
        let raw = decode_b64(&self.protected)
            .map_err(|_| malformed("protected header is not base64url"))?;
        serde_json::from_slice(&raw)
            .map_err(|e| malformed(format!("protected header is not valid JSON: {}", e)))
    }

    /// Empty for POST-as-GET.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        decode_b64(&self.payload).map_err(|_| malformed("payload is not base64url"))
    }

    pub fn is_post_as_get(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self.payload_bytes()?;
        serde_json::from_slice(&raw)
            .map_err(|e| malformed(format!("payload is not valid JSON: {}", e)))
    }

    pub fn verify(&self, key: &AccountKey) -> Result<()> {
        let signature = decode_b64(&self.signature).map_err(|_| {
            PkiError::acme(AcmeErrorKind::BadSignature, "signature is not base64url")
        })?;
        let signing_input = format!("{}.{}", self.protected, self.payload);
        key.verify(signing_input.as_bytes(), &signature)
    }
}

/// A JWS public key with the algorithm it was presented under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountKey {
    Ed25519 { x: Vec<u8> },
    EcP256 { point: Vec<u8> },
    EcP384 { point: Vec<u8> },
    Rsa { n: Vec<u8>, e: Vec<u8> },
}

#[derive(Debug, Deserialize)]
struct OkpJwk {
    kty: String,
    crv: String,
    x: String,
}

#[derive(Debug, Deserialize)]
struct EcJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

#[derive(Debug, Deserialize)]
struct RsaJwk {
    kty: String,
    n: String,
    e: String,
}

impl AccountKey {
    /// Parses `jwk` for use with `alg` and returns the key plus its RFC 7638
    /// thumbprint.
    pub fn from_jwk(alg: &str, jwk: &Value) -> Result<(Self, String)> {
        match alg {
            "EdDSA" => {
                let jwk: OkpJwk = parse_jwk(jwk)?;
                if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
                    return Err(bad_alg("EdDSA requires an Ed25519 OKP key"));
                }
                let x = decode_b64(&jwk.x).map_err(|_| bad_alg("invalid Ed25519 x"))?;
                if x.len() != 32 {
                    return Err(bad_alg("Ed25519 keys are 32 bytes"));
                }
                let thumbprint = compute_thumbprint(&[
                    ("crv", &jwk.crv),
                    ("kty", &jwk.kty),
                    ("x", &jwk.x),
                ]);
                Ok((AccountKey::Ed25519 { x }, thumbprint))
            }
            "ES256" | "ES384" => {
                let jwk: EcJwk = parse_jwk(jwk)?;
                let (crv, size) = if alg == "ES256" { ("P-256", 32) } else { ("P-384", 48) };
                if jwk.kty != "EC" || jwk.crv != crv {
                    return Err(bad_alg(format!("{} requires an EC {} key", alg, crv)));
                }
                let x = decode_b64(&jwk.x).map_err(|_| bad_alg("invalid EC x coordinate"))?;
                let y = decode_b64(&jwk.y).map_err(|_| bad_alg("invalid EC y coordinate"))?;
                if x.len() != size || y.len() != size {
                    return Err(bad_alg(format!("{} coordinates are {} bytes", crv, size)));
                }
                let mut point = Vec::with_capacity(1 + 2 * size);
                point.push(0x04);
                point.extend_from_slice(&x);
                point.extend_from_slice(&y);
                let thumbprint = compute_thumbprint(&[
                    ("crv", &jwk.crv),
                    ("kty", &jwk.kty),
                    ("x", &jwk.x),
                    ("y", &jwk.y),
                ]);
                let key = if alg == "ES256" {
                    AccountKey::EcP256 { point }
                } else {
                    AccountKey::EcP384 { point }
                };
                Ok((key, thumbprint))
            }
            "RS256" => {
                let jwk: RsaJwk = parse_jwk(jwk)?;
                if jwk.kty != "RSA" {
                    return Err(bad_alg("RS256 requires an RSA key"));
                }
                let n = decode_b64(&jwk.n).map_err(|_| bad_alg("invalid RSA modulus"))?;
                let e = decode_b64(&jwk.e).map_err(|_| bad_alg("invalid RSA exponent"))?;
                let thumbprint =
                    compute_thumbprint(&[("e", &jwk.e), ("kty", &jwk.kty), ("n", &jwk.n)]);
                Ok((AccountKey::Rsa { n, e }, thumbprint))
            }
            other => Err(bad_alg(format!("unsupported signature algorithm {}", other))),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let verified = match self {
            AccountKey::Ed25519 { x } => UnparsedPublicKey::new(&ED25519, x).verify(message, signature),
            AccountKey::EcP256 { point } => {
                UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point).verify(message, signature)
            }
            AccountKey::EcP384 { point } => {
                UnparsedPublicKey::new(&ECDSA_P384_SHA384_FIXED, point).verify(message, signature)
            }
            AccountKey::Rsa { n, e } => RsaPublicKeyComponents { n, e }.verify(
                &RSA_PKCS1_2048_8192_SHA256,
                message,
                signature,
            ),
        };
        verified.map_err(|_| PkiError::acme(AcmeErrorKind::BadSignature, "JWS signature is invalid"))
    }

    /// True when `spki` carries this same public key.
    pub fn matches_spki(&self, spki: &SubjectPublicKeyInfo<'_>) -> bool {
        let raw: &[u8] = &spki.subject_public_key.data;
        match self {
            AccountKey::Ed25519 { x } => raw == x.as_slice(),
            AccountKey::EcP256 { point } | AccountKey::EcP384 { point } => raw == point.as_slice(),
            AccountKey::Rsa { n, e } => match spki.parsed() {
                Ok(PublicKey::RSA(rsa)) => {
                    strip_leading_zeros(rsa.modulus) == strip_leading_zeros(n)
                        && strip_leading_zeros(rsa.exponent) == strip_leading_zeros(e)
                }
                _ => false,
            },
        }
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn parse_jwk<T: DeserializeOwned>(jwk: &Value) -> Result<T> {
    serde_json::from_value(jwk.clone()).map_err(|e| bad_alg(format!("unreadable JWK: {}", e)))
}

/// RFC 7638 thumbprint over the required members in lexicographic order.
pub fn compute_thumbprint(entries: &[(&str, &str)]) -> String {
    let mut sorted = entries.to_vec();
    sorted.sort_unstable_by(|lhs, rhs| lhs.0.cmp(rhs.0));
    let mut serialized = String::from("{");
    for (index, (name, value)) in sorted.iter().enumerate() {
        if index > 0 {
            serialized.push(',');
        }
        serialized.push('"');
        serialized.push_str(name);
        serialized.push_str("\":\"");
        serialized.push_str(value);
        serialized.push('"');
    }
    serialized.push('}');
    URL_SAFE_NO_PAD.encode(Sha256::digest(serialized.as_bytes()))
}

pub fn decode_b64(value: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value)
}

pub fn encode_b64(value: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(value)
}

fn malformed(detail: impl Into<String>) -> PkiError {
    PkiError::acme(AcmeErrorKind::Malformed, detail)
}

fn bad_alg(detail: impl Into<String>) -> PkiError {
    PkiError::acme(AcmeErrorKind::BadSignatureAlgorithm, detail)
}
