//! Tenant identity and storage namespace derivation.
//!
//! Every storage access is addressed by a [`Namespace`]. The namespace of a
//! tenant is a digest of its id, so it cannot be inverted back into the id or
//! derived from another tenant's namespace, and it can never be equal to the
//! default (non-tenant) namespace, which carries no suffix at all.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Base database name used when none is configured.
pub const DEFAULT_BASE_NAMESPACE: &str = "deviceauth";

const MAX_TENANT_ID_LEN: usize = 128;
// Hex characters of the digest kept in the namespace name.
const NAMESPACE_DIGEST_LEN: usize = 32;
const NAMESPACE_DIGEST_DOMAIN: &[u8] = b"deviceauth/tenant-namespace/v1:";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid tenant id {id:?}: {reason}")]
pub struct InvalidTenantId {
    pub id: String,
    pub reason: &'static str,
}

/// A validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let id = raw.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id.len() > MAX_TENANT_ID_LEN {
            Some("too long")
        } else if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            Some("only ASCII letters, digits, '-' and '_' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidTenantId { id, reason }),
            None => Ok(Self(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the isolated storage partition of one tenant (or of the default,
/// non-tenant deployment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    /// The namespace used when a request carries no tenant.
    pub fn default_for(base: &str) -> Self {
        Self(base.to_string())
    }

    pub fn for_tenant(base: &str, tenant: &TenantId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(NAMESPACE_DIGEST_DOMAIN);
        hasher.update(tenant.as_str().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("{}-{}", base, &digest[..NAMESPACE_DIGEST_LEN]))
    }

    /// Recognize a namespace name found in storage.
    ///
    /// Only the default name and names of the shape produced by
    /// [`Namespace::for_tenant`] are accepted; anything else is foreign data.
    pub fn from_existing(base: &str, name: &str) -> Option<Self> {
        if name == base {
            return Some(Self::default_for(base));
        }
        let suffix = name.strip_prefix(base)?.strip_prefix('-')?;
        let well_formed = suffix.len() == NAMESPACE_DIGEST_LEN
            && suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        well_formed.then(|| Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable per-request identity threaded through every scoped operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    tenant: Option<TenantId>,
    request_id: Option<String>,
}

impl RequestContext {
    /// Context of a single-tenant deployment.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant: Some(tenant),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn namespace(&self, base: &str) -> Namespace {
        match &self.tenant {
            Some(tenant) => Namespace::for_tenant(base, tenant),
            None => Namespace::default_for(base),
        }
    }
}
