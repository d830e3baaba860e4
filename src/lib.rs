pub mod acme;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod pki;
pub mod storage;

pub use backend::PkiBackend;
pub use config::EngineConfig;
pub use error::{AcmeErrorKind, PkiError, Result};
