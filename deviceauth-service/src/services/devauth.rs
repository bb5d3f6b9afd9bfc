//! Device and auth set state machine with token lifecycle.
//!
//! Every operation runs inside a [`TenantScope`], so all storage access is
//! confined to one namespace. Multi-step writes are ordered so a crash part
//! way through leaves either a consistent state or records the reconciler
//! recognizes as broken:
//!
//! - accept: demote the previously accepted set, drop the device's tokens,
//!   accept the target set, refresh the device status, mint the token
//! - reject / reset: update the sets, refresh the device status, drop tokens
//! - decommission: flip the device flag; the cascade is left to the reconciler

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{AuthOutcome, AuthRequest, PreAuthRequest};
use crate::models::{id_data_digest, AuthSet, AuthSetStatus, Device, DeviceStatus, Token};
use crate::services::context::{Namespace, RequestContext, TenantId, DEFAULT_BASE_NAMESPACE};
use crate::services::error::DevAuthError;
use crate::services::jwt::{DeviceClaims, TokenSigner};
use crate::services::store::{AuthSetFilter, DataStore, DeviceUpdate, StoreError, TokenFilter};
use crate::services::tenantadm::TenantVerifier;

/// Default device token lifetime: one week.
pub const DEFAULT_TOKEN_EXPIRY_SECONDS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct DevAuthSettings {
    pub base_namespace: String,
    pub token_expiry: Duration,
}

impl Default for DevAuthSettings {
    fn default() -> Self {
        Self {
            base_namespace: DEFAULT_BASE_NAMESPACE.to_string(),
            token_expiry: Duration::seconds(DEFAULT_TOKEN_EXPIRY_SECONDS),
        }
    }
}

#[derive(Clone)]
pub struct DevAuth {
    store: Arc<dyn DataStore>,
    signer: Arc<dyn TokenSigner>,
    tenant_verifier: Option<Arc<dyn TenantVerifier>>,
    settings: DevAuthSettings,
}

impl DevAuth {
    pub fn new(
        store: Arc<dyn DataStore>,
        signer: Arc<dyn TokenSigner>,
        settings: DevAuthSettings,
    ) -> Self {
        Self {
            store,
            signer,
            tenant_verifier: None,
            settings,
        }
    }

    /// Enable multi-tenancy: tenant tokens are verified and select the namespace.
    pub fn with_tenant_verifier(mut self, verifier: Arc<dyn TenantVerifier>) -> Self {
        self.tenant_verifier = Some(verifier);
        self
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn settings(&self) -> &DevAuthSettings {
        &self.settings
    }

    /// View of the service confined to the namespace of `ctx`.
    pub fn with_context(&self, ctx: RequestContext) -> TenantScope<'_> {
        let ns = ctx.namespace(&self.settings.base_namespace);
        TenantScope { app: self, ctx, ns }
    }

    /// Handle a device's authentication request.
    ///
    /// With a tenant verifier configured, the request's tenant token decides
    /// the tenant; a token bound to a different tenant than `ctx` is refused.
    #[instrument(skip(self, ctx, req), fields(request_id = ctx.request_id()))]
    pub async fn submit_auth_request(
        &self,
        ctx: RequestContext,
        req: &AuthRequest,
    ) -> Result<AuthOutcome, DevAuthError> {
        req.validate()?;
        let ctx = self.resolve_tenant(ctx, &req.tenant_token).await.inspect_err(|e| {
            metrics::counter!("deviceauth_auth_requests_total", "outcome" => "unauthorized")
                .increment(1);
            tracing::warn!(error = %e, "Tenant resolution failed");
        })?;
        self.with_context(ctx).submit_auth_request(req).await
    }

    async fn resolve_tenant(
        &self,
        ctx: RequestContext,
        tenant_token: &str,
    ) -> Result<RequestContext, DevAuthError> {
        let Some(verifier) = &self.tenant_verifier else {
            return Ok(ctx);
        };
        if tenant_token.is_empty() {
            return Err(DevAuthError::Unauthorized("tenant token missing".to_string()));
        }

        let tenant = verifier.verify_token(tenant_token, ctx.request_id()).await?;
        if tenant.is_suspended() {
            return Err(DevAuthError::Unauthorized(
                "tenant account suspended".to_string(),
            ));
        }
        let tenant_id = TenantId::parse(tenant.id)?;
        if ctx.tenant().is_some_and(|t| *t != tenant_id) {
            return Err(DevAuthError::Unauthorized(
                "tenant token does not match request tenant".to_string(),
            ));
        }

        let resolved = RequestContext::for_tenant(tenant_id);
        Ok(match ctx.request_id() {
            Some(request_id) => resolved.with_request_id(request_id),
            None => resolved,
        })
    }

    /// Check a device token against its signature and the stored state.
    ///
    /// A missing token row, a set that is no longer accepted and a device
    /// being decommissioned all fail as `Unauthorized`. Never writes.
    #[instrument(skip(self, token))]
    pub async fn verify_token(&self, token: &str) -> Result<DeviceClaims, DevAuthError> {
        let claims = self.signer.verify(token).map_err(|e| {
            tracing::debug!(error = %e, "Device token rejected by signer");
            verification_failed("invalid")
        })?;

        let ns = match &claims.tenant {
            Some(tenant) => {
                let tenant = TenantId::parse(tenant.as_str())
                    .map_err(|_| verification_failed("invalid"))?;
                Namespace::for_tenant(&self.settings.base_namespace, &tenant)
            }
            None => Namespace::default_for(&self.settings.base_namespace),
        };

        let row = self
            .store
            .get_token(&ns, &claims.jti)
            .await?
            .ok_or_else(|| verification_failed("revoked"))?;
        if row.token != token
            || row.device_id != claims.sub
            || row.auth_set_id != claims.auth_set_id
        {
            return Err(verification_failed("mismatch"));
        }
        if row.is_expired(Utc::now()) {
            return Err(verification_failed("expired"));
        }

        let accepted = self
            .store
            .get_auth_set_by_id(&ns, &claims.auth_set_id)
            .await?
            .is_some_and(|s| s.status == AuthSetStatus::Accepted && s.device_id == claims.sub);
        if !accepted {
            return Err(verification_failed("auth_set"));
        }

        let live = self
            .store
            .get_device_by_id(&ns, &claims.sub)
            .await?
            .is_some_and(|d| !d.decommissioning);
        if !live {
            return Err(verification_failed("device"));
        }

        Ok(claims)
    }
}

fn verification_failed(reason: &'static str) -> DevAuthError {
    tracing::debug!(reason, "Device token verification failed");
    metrics::counter!("deviceauth_token_verifications_failed_total", "reason" => reason)
        .increment(1);
    DevAuthError::Unauthorized("invalid device token".to_string())
}

fn transition(kind: &'static str) {
    metrics::counter!("deviceauth_transitions_total", "kind" => kind).increment(1);
}

/// Tenant-scoped view of [`DevAuth`].
pub struct TenantScope<'a> {
    app: &'a DevAuth,
    ctx: RequestContext,
    ns: Namespace,
}

impl TenantScope<'_> {
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    fn store(&self) -> &dyn DataStore {
        self.app.store.as_ref()
    }

    // ==================== Device requests ====================

    /// Record an authentication request; the tenant token is not verified here.
    #[instrument(skip(self, req), fields(namespace = %self.ns))]
    pub async fn submit_auth_request(&self, req: &AuthRequest) -> Result<AuthOutcome, DevAuthError> {
        req.validate()?;
        let digest = id_data_digest(&req.id_data);

        let device = match self.store().get_device_by_identity(&self.ns, &digest).await? {
            Some(device) => device,
            None => match self.create_device(req).await? {
                Some(outcome) => return Ok(outcome),
                // Lost a creation race; continue with the winner's device.
                None => self
                    .store()
                    .get_device_by_identity(&self.ns, &digest)
                    .await?
                    .ok_or_else(|| {
                        DevAuthError::Conflict("device identity is being created".to_string())
                    })?,
            },
        };

        if device.decommissioning {
            metrics::counter!("deviceauth_auth_requests_total", "outcome" => "conflict")
                .increment(1);
            return Err(DevAuthError::Conflict(
                "device is being decommissioned".to_string(),
            ));
        }

        if let Some(set) = self
            .store()
            .get_auth_set_by_key(&self.ns, &device.id, &req.pub_key)
            .await?
        {
            return self.respond_to_known_key(&device, set).await;
        }

        let set = AuthSet::new(
            device.id.clone(),
            req.id_data.clone(),
            req.pub_key.clone(),
            AuthSetStatus::Pending,
        );
        match self.store().add_auth_set(&self.ns, &set).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                let existing = self
                    .store()
                    .get_auth_set_by_key(&self.ns, &device.id, &req.pub_key)
                    .await?
                    .ok_or_else(|| DevAuthError::Conflict("auth set is being created".to_string()))?;
                return self.respond_to_known_key(&device, existing).await;
            }
            Err(e) => return Err(e.into()),
        }

        let update = DeviceUpdate {
            pub_key: Some(req.pub_key.clone()),
            ..Default::default()
        };
        self.store().update_device(&self.ns, &device.id, &update).await?;
        self.store().refresh_device_status(&self.ns, &device.id).await?;

        tracing::info!(device_id = %device.id, auth_set_id = %set.id, "New auth set pending");
        metrics::counter!("deviceauth_auth_requests_total", "outcome" => "pending").increment(1);
        Ok(AuthOutcome::NotAccepted {
            device_id: device.id,
            auth_set_id: set.id,
            status: AuthSetStatus::Pending,
        })
    }

    /// Returns `None` when another request created the identity first.
    async fn create_device(&self, req: &AuthRequest) -> Result<Option<AuthOutcome>, DevAuthError> {
        let device = Device::new(
            req.id_data.clone(),
            req.pub_key.clone(),
            req.tenant_token.clone(),
            DeviceStatus::Pending,
        );
        match self.store().add_device(&self.ns, &device).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let set = AuthSet::new(
            device.id.clone(),
            req.id_data.clone(),
            req.pub_key.clone(),
            AuthSetStatus::Pending,
        );
        self.store().add_auth_set(&self.ns, &set).await?;

        tracing::info!(device_id = %device.id, auth_set_id = %set.id, "New device pending");
        metrics::counter!("deviceauth_auth_requests_total", "outcome" => "pending").increment(1);
        Ok(Some(AuthOutcome::NotAccepted {
            device_id: device.id,
            auth_set_id: set.id,
            status: AuthSetStatus::Pending,
        }))
    }

    async fn respond_to_known_key(
        &self,
        device: &Device,
        set: AuthSet,
    ) -> Result<AuthOutcome, DevAuthError> {
        match set.status {
            AuthSetStatus::Accepted => {
                let token = self.current_or_new_token(device, &set).await?;
                metrics::counter!("deviceauth_auth_requests_total", "outcome" => "accepted")
                    .increment(1);
                Ok(AuthOutcome::Accepted { token: token.token })
            }
            AuthSetStatus::Preauthorized => {
                let token = self.accept(device, &set).await?;
                tracing::info!(device_id = %device.id, auth_set_id = %set.id, "Preauthorized auth set accepted");
                transition("preauthorized_accept");
                metrics::counter!("deviceauth_auth_requests_total", "outcome" => "accepted")
                    .increment(1);
                Ok(AuthOutcome::Accepted { token: token.token })
            }
            status @ (AuthSetStatus::Pending | AuthSetStatus::Rejected) => {
                metrics::counter!("deviceauth_auth_requests_total", "outcome" => status.to_string())
                    .increment(1);
                Ok(AuthOutcome::NotAccepted {
                    device_id: device.id.clone(),
                    auth_set_id: set.id,
                    status,
                })
            }
        }
    }

    async fn current_or_new_token(
        &self,
        device: &Device,
        set: &AuthSet,
    ) -> Result<Token, DevAuthError> {
        if let Some(token) = self.store().get_token_for_device(&self.ns, &device.id).await? {
            if token.auth_set_id == set.id && !token.is_expired(Utc::now()) {
                return Ok(token);
            }
        }
        self.store()
            .delete_tokens(&self.ns, &TokenFilter::AuthSet(set.id.clone()))
            .await?;
        self.mint_token(device, set).await
    }

    // ==================== Operator actions ====================

    /// Register an identity/key pair before the device first connects.
    #[instrument(skip(self, req), fields(namespace = %self.ns))]
    pub async fn preauthorize(&self, req: &PreAuthRequest) -> Result<Device, DevAuthError> {
        req.validate()?;
        let digest = id_data_digest(&req.id_data);
        if self
            .store()
            .get_device_by_identity(&self.ns, &digest)
            .await?
            .is_some()
        {
            return Err(DevAuthError::DeviceExists);
        }

        let device = Device::new(
            req.id_data.clone(),
            req.pub_key.clone(),
            String::new(),
            DeviceStatus::Preauthorized,
        );
        match self.store().add_device(&self.ns, &device).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => return Err(DevAuthError::DeviceExists),
            Err(e) => return Err(e.into()),
        }
        let set = AuthSet::new(
            device.id.clone(),
            req.id_data.clone(),
            req.pub_key.clone(),
            AuthSetStatus::Preauthorized,
        );
        self.store().add_auth_set(&self.ns, &set).await?;

        tracing::info!(device_id = %device.id, auth_set_id = %set.id, "Device preauthorized");
        transition("preauthorize");
        Ok(device)
    }

    /// Accept the device's most recently submitted auth set.
    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn accept_device(&self, device_id: &str) -> Result<Token, DevAuthError> {
        let device = self.live_device(device_id).await?;
        let set = self
            .store()
            .get_auth_sets_for_device(&self.ns, device_id)
            .await?
            .pop()
            .ok_or(DevAuthError::AuthSetNotFound)?;

        let token = self.accept(&device, &set).await?;
        tracing::info!(device_id = %device_id, auth_set_id = %set.id, "Device accepted");
        transition("accept");
        Ok(token)
    }

    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn accept_auth_set(
        &self,
        device_id: &str,
        auth_set_id: &str,
    ) -> Result<Token, DevAuthError> {
        let device = self.live_device(device_id).await?;
        let set = self.owned_auth_set(device_id, auth_set_id).await?;

        let token = self.accept(&device, &set).await?;
        tracing::info!(device_id = %device_id, auth_set_id = %auth_set_id, "Auth set accepted");
        transition("accept");
        Ok(token)
    }

    async fn accept(&self, device: &Device, set: &AuthSet) -> Result<Token, DevAuthError> {
        let demoted = self
            .store()
            .update_auth_sets_status(
                &self.ns,
                &AuthSetFilter::device(&device.id)
                    .status(AuthSetStatus::Accepted)
                    .excluding(&set.id),
                AuthSetStatus::Rejected,
            )
            .await?;
        if demoted > 0 {
            tracing::info!(device_id = %device.id, demoted, "Previously accepted auth set rejected");
        }
        self.revoke_device_tokens(&device.id, "superseded").await?;
        self.store()
            .update_auth_sets_status(
                &self.ns,
                &AuthSetFilter::device(&device.id).id(&set.id),
                AuthSetStatus::Accepted,
            )
            .await?;
        self.store()
            .refresh_device_status(&self.ns, &device.id)
            .await?
            .ok_or(DevAuthError::DeviceNotFound)?;

        self.mint_token(device, set).await
    }

    /// Reject every auth set of the device and revoke its tokens.
    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn reject_device(&self, device_id: &str) -> Result<(), DevAuthError> {
        self.live_device(device_id).await?;
        self.store()
            .update_auth_sets_status(
                &self.ns,
                &AuthSetFilter::device(device_id),
                AuthSetStatus::Rejected,
            )
            .await?;
        self.store().refresh_device_status(&self.ns, device_id).await?;
        self.revoke_device_tokens(device_id, "rejected").await?;

        tracing::info!(device_id = %device_id, "Device rejected");
        transition("reject");
        Ok(())
    }

    /// Reject one auth set, revoking the token bound to it.
    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn reject_auth_set(
        &self,
        device_id: &str,
        auth_set_id: &str,
    ) -> Result<(), DevAuthError> {
        self.live_device(device_id).await?;
        self.owned_auth_set(device_id, auth_set_id).await?;

        self.store()
            .update_auth_sets_status(
                &self.ns,
                &AuthSetFilter::device(device_id).id(auth_set_id),
                AuthSetStatus::Rejected,
            )
            .await?;
        self.store().refresh_device_status(&self.ns, device_id).await?;
        let revoked = self
            .store()
            .delete_tokens(&self.ns, &TokenFilter::AuthSet(auth_set_id.to_string()))
            .await?;
        metrics::counter!("deviceauth_tokens_revoked_total", "reason" => "rejected")
            .increment(revoked);

        tracing::info!(device_id = %device_id, auth_set_id = %auth_set_id, "Auth set rejected");
        transition("reject");
        Ok(())
    }

    /// Force re-authentication: every auth set back to pending, tokens revoked.
    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn reset_device(&self, device_id: &str) -> Result<(), DevAuthError> {
        self.live_device(device_id).await?;
        self.store()
            .update_auth_sets_status(
                &self.ns,
                &AuthSetFilter::device(device_id),
                AuthSetStatus::Pending,
            )
            .await?;
        self.store().refresh_device_status(&self.ns, device_id).await?;
        self.revoke_device_tokens(device_id, "reset").await?;

        tracing::info!(device_id = %device_id, "Device reset");
        transition("reset");
        Ok(())
    }

    /// Mark the device for deletion. Its tokens stop verifying at once; the
    /// rows are removed by the reconciler.
    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn decommission(&self, device_id: &str) -> Result<(), DevAuthError> {
        let update = DeviceUpdate {
            decommissioning: Some(true),
            ..Default::default()
        };
        if !self
            .store()
            .update_device(&self.ns, device_id, &update)
            .await?
        {
            return Err(DevAuthError::DeviceNotFound);
        }

        tracing::info!(device_id = %device_id, "Device decommissioning");
        transition("decommission");
        Ok(())
    }

    /// Delete one token. Auth set and device state are left alone.
    #[instrument(skip(self), fields(namespace = %self.ns))]
    pub async fn revoke_token(&self, token_id: &str) -> Result<(), DevAuthError> {
        if !self.store().delete_token(&self.ns, token_id).await? {
            return Err(DevAuthError::TokenNotFound);
        }
        tracing::info!(token_id = %token_id, "Token revoked");
        metrics::counter!("deviceauth_tokens_revoked_total", "reason" => "revoked").increment(1);
        Ok(())
    }

    // ==================== Queries ====================

    /// Includes devices being decommissioned.
    pub async fn get_device(&self, device_id: &str) -> Result<Device, DevAuthError> {
        self.store()
            .get_device_by_id(&self.ns, device_id)
            .await?
            .ok_or(DevAuthError::DeviceNotFound)
    }

    pub async fn get_devices(&self, skip: u64, limit: u64) -> Result<Vec<Device>, DevAuthError> {
        Ok(self.store().get_devices(&self.ns, skip, limit).await?)
    }

    pub async fn get_device_token(&self, device_id: &str) -> Result<Token, DevAuthError> {
        self.store()
            .get_token_for_device(&self.ns, device_id)
            .await?
            .ok_or(DevAuthError::TokenNotFound)
    }

    /// Auth sets of a device, oldest first.
    pub async fn get_auth_sets(&self, device_id: &str) -> Result<Vec<AuthSet>, DevAuthError> {
        self.get_device(device_id).await?;
        Ok(self
            .store()
            .get_auth_sets_for_device(&self.ns, device_id)
            .await?)
    }

    // ==================== Helpers ====================

    /// The device, unless it is missing or being decommissioned.
    async fn live_device(&self, device_id: &str) -> Result<Device, DevAuthError> {
        match self.store().get_device_by_id(&self.ns, device_id).await? {
            Some(device) if !device.decommissioning => Ok(device),
            _ => Err(DevAuthError::DeviceNotFound),
        }
    }

    async fn owned_auth_set(
        &self,
        device_id: &str,
        auth_set_id: &str,
    ) -> Result<AuthSet, DevAuthError> {
        match self.store().get_auth_set_by_id(&self.ns, auth_set_id).await? {
            Some(set) if set.device_id == device_id => Ok(set),
            _ => Err(DevAuthError::AuthSetNotFound),
        }
    }

    async fn revoke_device_tokens(
        &self,
        device_id: &str,
        reason: &'static str,
    ) -> Result<(), DevAuthError> {
        let revoked = self
            .store()
            .delete_tokens(&self.ns, &TokenFilter::Device(device_id.to_string()))
            .await?;
        metrics::counter!("deviceauth_tokens_revoked_total", "reason" => reason).increment(revoked);
        Ok(())
    }

    async fn mint_token(&self, device: &Device, set: &AuthSet) -> Result<Token, DevAuthError> {
        let now = Utc::now();
        let expires_at = now + self.app.settings.token_expiry;
        let id = Uuid::new_v4().to_string();

        let claims = DeviceClaims {
            jti: id.clone(),
            sub: device.id.clone(),
            auth_set_id: set.id.clone(),
            tenant: self.ctx.tenant().map(|t| t.to_string()),
            iss: self.app.signer.issuer().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let signed = self.app.signer.sign(&claims).map_err(|e| {
            tracing::error!(error = %e, device_id = %device.id, "Failed to sign device token");
            DevAuthError::Signing(e)
        })?;

        let token = Token {
            id,
            device_id: device.id.clone(),
            auth_set_id: set.id.clone(),
            token: signed,
            expires_at: Some(expires_at),
            created_ts: now,
        };
        self.store().add_token(&self.ns, &token).await?;

        tracing::info!(device_id = %device.id, token_id = %token.id, "Device token issued");
        metrics::counter!("deviceauth_tokens_issued_total").increment(1);
        Ok(token)
    }
}
