use service_core::error::AppError;
use thiserror::Error;

use crate::services::context::InvalidTenantId;
use crate::services::store::StoreError;
use crate::services::tenantadm::TenantAdmError;

/// Stable classification of a failed operation.
///
/// Reconciler findings are deliberately absent; they never fail a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Conflict,
    Unavailable,
    BadGateway,
    InvalidInput,
    Internal,
}

#[derive(Error, Debug)]
pub enum DevAuthError {
    #[error("Device not found")]
    DeviceNotFound,

    #[error("Auth set not found")]
    AuthSetNotFound,

    #[error("Token not found")]
    TokenNotFound,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Device already exists")]
    DeviceExists,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    InvalidTenant(#[from] InvalidTenantId),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    TenantAdm(#[from] TenantAdmError),

    #[error("Token signing failed: {0}")]
    Signing(anyhow::Error),
}

impl DevAuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DevAuthError::DeviceNotFound
            | DevAuthError::AuthSetNotFound
            | DevAuthError::TokenNotFound => ErrorKind::NotFound,
            DevAuthError::Unauthorized(_) | DevAuthError::InvalidTenant(_) => {
                ErrorKind::Unauthorized
            }
            DevAuthError::DeviceExists | DevAuthError::Conflict(_) => ErrorKind::Conflict,
            DevAuthError::InvalidInput(_) => ErrorKind::InvalidInput,
            DevAuthError::Store(StoreError::Duplicate(_)) => ErrorKind::Conflict,
            DevAuthError::Store(StoreError::Poisoned(_)) => ErrorKind::Internal,
            DevAuthError::Store(StoreError::Database(_) | StoreError::Contended(_)) => {
                ErrorKind::Unavailable
            }
            DevAuthError::TenantAdm(TenantAdmError::Rejected(_)) => ErrorKind::Unauthorized,
            DevAuthError::TenantAdm(TenantAdmError::Transport(_)) => ErrorKind::Unavailable,
            DevAuthError::TenantAdm(TenantAdmError::UnexpectedStatus(_))
            | DevAuthError::TenantAdm(TenantAdmError::Decode(_)) => ErrorKind::BadGateway,
            DevAuthError::Signing(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}

impl From<validator::ValidationErrors> for DevAuthError {
    fn from(err: validator::ValidationErrors) -> Self {
        DevAuthError::InvalidInput(err.to_string())
    }
}

impl From<DevAuthError> for AppError {
    fn from(err: DevAuthError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            // Storage or upstream detail stays in the logs.
            ErrorKind::Unauthorized => match err {
                DevAuthError::TenantAdm(e) => AppError::Unauthorized(anyhow::anyhow!(e.to_string())),
                DevAuthError::Unauthorized(reason) => AppError::Unauthorized(anyhow::anyhow!(reason)),
                _ => AppError::Unauthorized(anyhow::anyhow!("Unauthorized")),
            },
            ErrorKind::Conflict => AppError::Conflict(anyhow::anyhow!(err.to_string())),
            ErrorKind::InvalidInput => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
            ErrorKind::BadGateway => AppError::BadGateway(err.to_string()),
            ErrorKind::Unavailable => match err {
                DevAuthError::Store(StoreError::Database(e)) => AppError::from(e),
                other => AppError::ServiceUnavailable(other.to_string()),
            },
            ErrorKind::Internal => match err {
                DevAuthError::Signing(e) => AppError::InternalError(e),
                other => AppError::InternalError(anyhow::anyhow!(other.to_string())),
            },
        }
    }
}
