pub mod account;
pub mod challenge;
pub mod identifier;
pub mod jws;
pub mod nonce;
pub mod order;
pub mod state;

pub use account::{AccountStatus, AccountStore, AcmeAccount};
pub use challenge::{ChallengeValidator, RejectingValidator};
pub use identifier::{AcmeIdentifier, IdentifierType};
pub use jws::{AccountKey, JwsRequest};
pub use nonce::NonceManager;
pub use order::{
    AcmeAuthorization, AcmeChallenge, AcmeOrder, AuthorizationStatus, ChallengeStatus,
    ChallengeType, OrderStatus, OrderStore,
};
pub use state::{
    AccountOutcome, AcmeState, AcmeTidyStatus, AuthorizationResponse, ChallengeResponse,
    Directory, OrderListResponse, OrderOutcome, RevocationAuthorization,
};
