use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Duration;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::{DeviceAuthConfig, JwtConfig, JwtKey, TenantAdmConfig};
use crate::services::{
    get_metrics, DataStore, DevAuth, DevAuthSettings, JwtSigner, MongoStore, Namespace,
    TenantAdmClient, TenantVerifier, TokenSigner,
};
use crate::workers::Reconciler;

#[derive(Clone)]
pub struct AppState {
    pub config: DeviceAuthConfig,
    pub store: Arc<dyn DataStore>,
    pub devauth: DevAuth,
}

impl AppState {
    /// Connect to MongoDB and wire the services described by `config`.
    pub async fn build(config: DeviceAuthConfig) -> Result<Self, AppError> {
        let store = MongoStore::connect(&config.mongodb.uri, &config.mongodb.database).await?;
        store
            .initialize_indexes(&Namespace::default_for(&config.mongodb.database))
            .await
            .map_err(|e| {
                tracing::error!("Failed to initialize database indexes: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e))
            })?;

        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(
        config: DeviceAuthConfig,
        store: Arc<dyn DataStore>,
    ) -> Result<Self, AppError> {
        let signer = build_signer(&config.jwt)?;
        let settings = DevAuthSettings {
            base_namespace: config.mongodb.database.clone(),
            token_expiry: Duration::seconds(config.jwt.expiry_seconds),
        };

        let mut devauth = DevAuth::new(store.clone(), signer, settings);
        if let Some(verifier) = build_tenant_verifier(config.tenantadm.as_ref())? {
            devauth = devauth.with_tenant_verifier(verifier);
        } else {
            tracing::info!("TENANTADM_ADDR not set, running single-tenant");
        }

        Ok(Self {
            config,
            store,
            devauth,
        })
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.config.reconciler.clone())
    }
}

pub fn build_signer(config: &JwtConfig) -> Result<Arc<dyn TokenSigner>, AppError> {
    let signer = match &config.key {
        JwtKey::Secret(secret) => JwtSigner::from_secret(secret.as_bytes(), &config.issuer),
        JwtKey::RsaPem {
            private_key_path,
            public_key_path,
        } => JwtSigner::from_rsa_pem_files(private_key_path, public_key_path, &config.issuer)
            .map_err(AppError::ConfigError)?,
    };
    Ok(Arc::new(signer))
}

pub fn build_tenant_verifier(
    config: Option<&TenantAdmConfig>,
) -> Result<Option<Arc<dyn TenantVerifier>>, AppError> {
    let Some(config) = config else {
        return Ok(None);
    };
    let client: Arc<dyn TenantVerifier> = Arc::new(
        TenantAdmClient::new(&config.addr, config.timeout)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
    );
    Ok(Some(client))
}

/// Health, readiness and metrics endpoints for orchestrators and Prometheus.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": state.config.service_name,
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": state.config.service_name,
                "error": e.to_string()
            })),
        ),
    }
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
