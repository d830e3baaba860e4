pub mod builder;
pub mod rebuilder;
pub mod scheduler;

pub use builder::{
    crl_to_pem, inspect_crl, BuiltCrl, CrlBuildReport, CrlBuilder, CrlId, CrlKind, CrlSummary,
    LocalCrlConfig, CRL_PEM_TAG,
};
pub use rebuilder::{CrlRebuilder, RebuildOutcome};
pub use scheduler::{spawn_scheduler, PeriodicTask};
