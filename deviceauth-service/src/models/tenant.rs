use serde::{Deserialize, Serialize};

pub const TENANT_STATUS_SUSPENDED: &str = "suspended";

/// Tenant metadata as returned by the tenant administration service.
///
/// Read-only here; the tenant administration service owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub plan: String,
}

impl Tenant {
    pub fn is_suspended(&self) -> bool {
        self.status == TENANT_STATUS_SUSPENDED
    }
}
