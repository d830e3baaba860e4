pub mod ca;
pub mod cert_store;
pub mod certutil;
pub mod crl;
pub mod issuer;
pub mod keys;
pub mod revocation;
pub mod serial;
pub mod tidy;

pub use ca::{
    CertificateAuthority, GenerateRootRequest, ImportResponse, IntermediateCsrRequest,
    IntermediateCsrResponse, IssueRequest, IssuedCertificate, IssuerResponse, SignOptions,
};
pub use cert_store::CertStore;
pub use certutil::CertDetails;
pub use issuer::{IssuerEntry, IssuerId, IssuerStore, KeyEntry, KeyId};
pub use keys::KeyType;
pub use revocation::{RevocationInfo, RevocationOutcome, RevocationStore};
pub use tidy::{Tidy, TidyRequest, TidyStatus};
