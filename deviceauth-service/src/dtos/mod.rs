use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::AuthSetStatus;

/// Authentication request submitted by a device.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthRequest {
    #[validate(length(min = 1, message = "Identity data is required"))]
    pub id_data: String,

    #[validate(length(min = 1, message = "Public key is required"))]
    pub pub_key: String,

    /// Tenant binding presented at provisioning; empty in single-tenant setups.
    #[serde(default)]
    pub tenant_token: String,
}

/// Identity/key pair registered by an operator ahead of the device's first request.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PreAuthRequest {
    #[validate(length(min = 1, message = "Identity data is required"))]
    pub id_data: String,

    #[validate(length(min = 1, message = "Public key is required"))]
    pub pub_key: String,
}

/// Result of an authentication request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthOutcome {
    /// The presented key is accepted; `token` authorizes device traffic.
    Accepted { token: String },
    /// Recorded but not (yet) approved. No token is issued.
    NotAccepted {
        device_id: String,
        auth_set_id: String,
        status: AuthSetStatus,
    },
}

impl AuthOutcome {
    pub fn token(&self) -> Option<&str> {
        match self {
            AuthOutcome::Accepted { token } => Some(token),
            AuthOutcome::NotAccepted { .. } => None,
        }
    }
}
