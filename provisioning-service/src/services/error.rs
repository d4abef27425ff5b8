use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Caller is not permitted to perform this action")]
    Unauthorized,

    #[error("Principal is inactive")]
    InactivePrincipal,

    #[error("Email already registered")]
    EmailAlreadyExists,

    #[error("Token not found")]
    TokenNotFound,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token already used")]
    TokenAlreadyUsed,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Rate limit exceeded, retry after {reset_at}")]
    RateLimitExceeded {
        remaining: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Resource not found")]
    ResourceNotFound,

    #[error("Onboarding state does not permit this transition")]
    InvalidOnboardingState,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisioningError {
    /// Only contention errors clear up on their own; everything else needs
    /// the caller to change something first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisioningError::RateLimitExceeded { .. })
    }

    /// Convert a store error for a call that knows which row a `NotFound`
    /// refers to. Other store errors convert as usual.
    pub fn from_store_missing(err: StoreError, missing: ProvisioningError) -> Self {
        match err {
            StoreError::NotFound(_) => missing,
            other => other.into(),
        }
    }
}

impl From<StoreError> for ProvisioningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(constraint) if constraint.contains("email") => {
                ProvisioningError::EmailAlreadyExists
            }
            // A missing referenced row is a logic error, not an outage.
            StoreError::NotFound(what) => {
                ProvisioningError::Internal(format!("Referenced row not found: {}", what))
            }
            other => ProvisioningError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ProvisioningError {
    fn from(err: validator::ValidationErrors) -> Self {
        ProvisioningError::Validation(err.to_string())
    }
}

impl From<ProvisioningError> for AppError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::Unauthorized => {
                AppError::Forbidden(anyhow::anyhow!("Caller is not permitted to perform this action"))
            }
            ProvisioningError::InactivePrincipal => {
                AppError::Forbidden(anyhow::anyhow!("Principal is inactive"))
            }
            ProvisioningError::EmailAlreadyExists => {
                AppError::Conflict(anyhow::anyhow!("Email already registered"))
            }
            ProvisioningError::TokenNotFound => AppError::NotFound(anyhow::anyhow!("Token not found")),
            ProvisioningError::TokenExpired => AppError::Gone(anyhow::anyhow!("Token expired")),
            ProvisioningError::TokenAlreadyUsed => AppError::Gone(anyhow::anyhow!("Token already used")),
            ProvisioningError::TokenRevoked => AppError::Gone(anyhow::anyhow!("Token revoked")),
            ProvisioningError::RateLimitExceeded {
                retry_after_secs, ..
            } => AppError::TooManyRequests(
                "Too many requests. Please try again later.".to_string(),
                Some(retry_after_secs),
            ),
            ProvisioningError::StoreUnavailable(e) => AppError::DatabaseError(anyhow::anyhow!(e)),
            ProvisioningError::PrincipalNotFound => {
                AppError::NotFound(anyhow::anyhow!("Principal not found"))
            }
            ProvisioningError::ResourceNotFound => {
                AppError::NotFound(anyhow::anyhow!("Resource not found"))
            }
            ProvisioningError::InvalidOnboardingState => AppError::Conflict(anyhow::anyhow!(
                "Onboarding state does not permit this transition"
            )),
            ProvisioningError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ProvisioningError::Internal(e) => AppError::InternalError(anyhow::anyhow!(e)),
        }
    }
}
