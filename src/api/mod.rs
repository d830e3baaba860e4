//! Request handlers. They take typed, already-parsed requests and return
//! serializable responses; HTTP routing is left to the host.

pub mod acme_handlers;
pub mod crl_handlers;
pub mod issuer_handlers;

pub use acme_handlers::{AcmeHandlers, AcmeReply, Problem};
pub use crl_handlers::{CrlBody, CrlFormat, CrlHandlers};
pub use issuer_handlers::IssuerHandlers;

use crate::error::{PkiError, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }

    /// User errors are reported quietly; everything else is logged.
    pub fn from_result(operation: &str, result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => {
                if e.is_user_error() {
                    debug!(operation, "Rejected request: {}", e);
                } else {
                    error!(operation, "Request failed: {}", e);
                }
                Self::error(e.to_string())
            }
        }
    }
}

/// Runs a handler future and turns a panic inside it into
/// `PkiError::Internal` so the worker survives.
pub async fn guarded<T, F>(operation: &'static str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(operation, "Handler panicked: {}", message);
            Err(PkiError::Internal(format!(
                "{} failed unexpectedly: {}",
                operation, message
            )))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
