//! Tenant-scoped persistence contract for devices, auth sets and tokens.
//!
//! The store offers no atomicity across collections. Callers order their
//! writes so that a crash between steps leaves only state the repair queries
//! at the bottom of [`DataStore`] can detect and remove.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{AuthSet, AuthSetStatus, Device, DeviceStatus, Token};
use crate::services::context::Namespace;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    #[error("concurrent updates kept conflicting: {0}")]
    Contended(String),
}

/// Field changes applied to one device; `updated_ts` is always refreshed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub status: Option<DeviceStatus>,
    pub pub_key: Option<String>,
    pub decommissioning: Option<bool>,
}

/// Selects auth sets of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSetFilter {
    pub device_id: String,
    pub id: Option<String>,
    pub status: Option<AuthSetStatus>,
    pub exclude_id: Option<String>,
}

impl AuthSetFilter {
    pub fn device(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            id: None,
            status: None,
            exclude_id: None,
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn status(mut self, status: AuthSetStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn excluding(mut self, id: &str) -> Self {
        self.exclude_id = Some(id.to_string());
        self
    }

    pub fn matches(&self, set: &AuthSet) -> bool {
        set.device_id == self.device_id
            && self.id.as_deref().is_none_or(|id| set.id == id)
            && self.status.is_none_or(|status| set.status == status)
            && self.exclude_id.as_deref().is_none_or(|id| set.id != id)
    }
}

/// Selects tokens to delete. No variant matches every token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFilter {
    Device(String),
    AuthSet(String),
}

impl TokenFilter {
    pub fn matches(&self, token: &Token) -> bool {
        match self {
            TokenFilter::Device(id) => token.device_id == *id,
            TokenFilter::AuthSet(id) => token.auth_set_id == *id,
        }
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    /// The default namespace plus every tenant namespace holding data.
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError>;

    // ==================== Devices ====================

    /// Fails with [`StoreError::Duplicate`] when the identity already exists.
    async fn add_device(&self, ns: &Namespace, device: &Device) -> Result<(), StoreError>;

    async fn get_device_by_id(
        &self,
        ns: &Namespace,
        id: &str,
    ) -> Result<Option<Device>, StoreError>;

    async fn get_device_by_identity(
        &self,
        ns: &Namespace,
        id_data_sha256: &str,
    ) -> Result<Option<Device>, StoreError>;

    /// Natural storage order; stable across calls only without concurrent writes.
    async fn get_devices(
        &self,
        ns: &Namespace,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Device>, StoreError>;

    /// Returns whether a device matched.
    async fn update_device(
        &self,
        ns: &Namespace,
        id: &str,
        update: &DeviceUpdate,
    ) -> Result<bool, StoreError>;

    // ==================== Auth sets ====================

    async fn add_auth_set(&self, ns: &Namespace, set: &AuthSet) -> Result<(), StoreError>;

    async fn get_auth_set_by_id(
        &self,
        ns: &Namespace,
        id: &str,
    ) -> Result<Option<AuthSet>, StoreError>;

    async fn get_auth_set_by_key(
        &self,
        ns: &Namespace,
        device_id: &str,
        pub_key: &str,
    ) -> Result<Option<AuthSet>, StoreError>;

    /// Oldest first.
    async fn get_auth_sets_for_device(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Vec<AuthSet>, StoreError>;

    /// Returns the number of auth sets changed.
    async fn update_auth_sets_status(
        &self,
        ns: &Namespace,
        filter: &AuthSetFilter,
        status: AuthSetStatus,
    ) -> Result<u64, StoreError>;

    /// Recompute a device's aggregate status from its auth sets and persist it.
    ///
    /// The write only lands if no other recomputation of the same device
    /// landed since the auth sets were read; otherwise it is redone, and
    /// [`StoreError::Contended`] is returned once retries run out. A stale
    /// status can therefore never overwrite a newer one.
    ///
    /// Returns `None` when the device does not exist.
    async fn refresh_device_status(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Option<DeviceStatus>, StoreError>;

    // ==================== Tokens ====================

    async fn add_token(&self, ns: &Namespace, token: &Token) -> Result<(), StoreError>;

    async fn get_token(&self, ns: &Namespace, id: &str) -> Result<Option<Token>, StoreError>;

    /// Most recently issued token of the device.
    async fn get_token_for_device(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Option<Token>, StoreError>;

    /// Returns whether a token was deleted.
    async fn delete_token(&self, ns: &Namespace, id: &str) -> Result<bool, StoreError>;

    async fn delete_tokens(&self, ns: &Namespace, filter: &TokenFilter) -> Result<u64, StoreError>;

    // ==================== Consistency repair ====================

    async fn get_devices_being_decommissioned(
        &self,
        ns: &Namespace,
    ) -> Result<Vec<Device>, StoreError>;

    async fn delete_devices_being_decommissioned(&self, ns: &Namespace) -> Result<u64, StoreError>;

    /// Ids of auth sets whose device is missing or being decommissioned.
    async fn get_broken_auth_sets(&self, ns: &Namespace) -> Result<Vec<String>, StoreError>;

    /// Deletes the auth sets matching [`DataStore::get_broken_auth_sets`],
    /// evaluated against the devices present at delete time.
    async fn delete_broken_auth_sets(&self, ns: &Namespace) -> Result<u64, StoreError>;

    /// Ids of tokens whose auth set is missing or not accepted, or whose
    /// device is missing or being decommissioned.
    async fn get_broken_tokens(&self, ns: &Namespace) -> Result<Vec<String>, StoreError>;

    async fn delete_broken_tokens(&self, ns: &Namespace) -> Result<u64, StoreError>;
}
