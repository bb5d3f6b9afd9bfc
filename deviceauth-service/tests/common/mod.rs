#![allow(dead_code)]

use deviceauth_service::dtos::{AuthOutcome, AuthRequest};
use deviceauth_service::models::Tenant;
use deviceauth_service::services::{
    DataStore, DevAuth, DevAuthSettings, JwtSigner, MemoryStore, RequestContext,
    StaticTenantVerifier, TenantId, DEFAULT_BASE_NAMESPACE,
};
use deviceauth_service::workers::{Reconciler, ReconcilerConfig};
use std::sync::Arc;

pub const TEST_SECRET: &[u8] = b"integration-test-secret";

// Tenant tokens known to the static verifier
pub const TENANT_A_TOKEN: &str = "tenant-token-a";
pub const TENANT_B_TOKEN: &str = "tenant-token-b";
pub const SUSPENDED_TOKEN: &str = "tenant-token-suspended";

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub devauth: DevAuth,
    pub reconciler: Reconciler,
}

impl TestApp {
    /// Single-tenant deployment.
    pub fn spawn() -> Self {
        Self::build(false)
    }

    /// Deployment with tenant tokens resolved by a static verifier.
    pub fn spawn_multi_tenant() -> Self {
        Self::build(true)
    }

    fn build(multi_tenant: bool) -> Self {
        let store = Arc::new(MemoryStore::new(DEFAULT_BASE_NAMESPACE));
        let signer = Arc::new(JwtSigner::from_secret(TEST_SECRET, "deviceauth"));
        let mut devauth = DevAuth::new(store.clone(), signer, DevAuthSettings::default());

        if multi_tenant {
            let verifier = StaticTenantVerifier::new()
                .with_tenant(TENANT_A_TOKEN, tenant("tenant-a", "active"))
                .with_tenant(TENANT_B_TOKEN, tenant("tenant-b", "active"))
                .with_tenant(SUSPENDED_TOKEN, tenant("tenant-c", "suspended"));
            devauth = devauth.with_tenant_verifier(Arc::new(verifier));
        }

        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
        Self {
            store,
            devauth,
            reconciler,
        }
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    /// Submit a request and return the new device's id, asserting it is pending.
    pub async fn submit_new(&self, ctx: RequestContext, req: &AuthRequest) -> String {
        match self
            .devauth
            .submit_auth_request(ctx, req)
            .await
            .expect("Failed to submit auth request")
        {
            AuthOutcome::NotAccepted { device_id, .. } => device_id,
            AuthOutcome::Accepted { .. } => panic!("new identity must not be accepted"),
        }
    }
}

pub fn tenant(id: &str, status: &str) -> Tenant {
    Tenant {
        id: id.to_string(),
        name: format!("{}-name", id),
        status: status.to_string(),
        plan: "enterprise".to_string(),
    }
}

pub fn tenant_ctx(id: &str) -> RequestContext {
    RequestContext::for_tenant(TenantId::parse(id).expect("valid tenant id"))
}

pub fn auth_request(id_data: &str, pub_key: &str) -> AuthRequest {
    AuthRequest {
        id_data: id_data.to_string(),
        pub_key: pub_key.to_string(),
        tenant_token: String::new(),
    }
}

pub fn tenant_auth_request(id_data: &str, pub_key: &str, tenant_token: &str) -> AuthRequest {
    AuthRequest {
        tenant_token: tenant_token.to_string(),
        ..auth_request(id_data, pub_key)
    }
}
