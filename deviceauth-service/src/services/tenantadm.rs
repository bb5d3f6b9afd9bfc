//! Tenant administration client.
//!
//! Resolves a device's tenant token into [`Tenant`] metadata through the
//! tenant administration service's internal verification endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use service_core::observability::{TracedClientExt, REQUEST_ID_HEADER};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

use crate::models::Tenant;

pub const TENANT_VERIFY_URI: &str = "/api/internal/v1/tenantadm/tenants/verify";

#[derive(Error, Debug)]
pub enum TenantAdmError {
    #[error("token verification request returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("tenant token verification failed: {0}")]
    Rejected(String),

    #[error("tenant token verification request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode tenant verification response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait TenantVerifier: Send + Sync {
    /// Verify a tenant token and return the tenant it binds to.
    async fn verify_token(
        &self,
        token: &str,
        request_id: Option<&str>,
    ) -> Result<Tenant, TenantAdmError>;
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

#[derive(Clone)]
pub struct TenantAdmClient {
    http: reqwest::Client,
    verify_url: String,
}

impl TenantAdmClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TenantAdmError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        tracing::info!(addr = %base_url, "Tenant administration client configured");
        Ok(Self {
            http,
            verify_url: format!("{}{}", base_url.trim_end_matches('/'), TENANT_VERIFY_URI),
        })
    }
}

#[async_trait]
impl TenantVerifier for TenantAdmClient {
    #[instrument(skip(self, token))]
    async fn verify_token(
        &self,
        token: &str,
        request_id: Option<&str>,
    ) -> Result<Tenant, TenantAdmError> {
        let mut request = self.http.traced_post(&self.verify_url).bearer_auth(token);
        if let Some(request_id) = request_id {
            request = request.header(REQUEST_ID_HEADER, request_id);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "Tenant token verification request failed");
            TenantAdmError::from(e)
        })?;

        match response.status() {
            StatusCode::OK => response
                .json::<Tenant>()
                .await
                .map_err(|e| TenantAdmError::Decode(e.to_string())),
            StatusCode::UNAUTHORIZED => {
                let body = response
                    .json::<ApiError>()
                    .await
                    .map_err(|e| TenantAdmError::Decode(e.to_string()))?;
                tracing::warn!(reason = %body.error, "Tenant token rejected");
                Err(TenantAdmError::Rejected(body.error))
            }
            status => {
                tracing::warn!(status = %status, "Unexpected tenant verification status");
                Err(TenantAdmError::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}

/// Verifier resolving tokens from a fixed table, for tests and local runs.
#[derive(Default)]
pub struct StaticTenantVerifier {
    tenants: HashMap<String, Tenant>,
}

impl StaticTenantVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, token: &str, tenant: Tenant) -> Self {
        self.tenants.insert(token.to_string(), tenant);
        self
    }
}

#[async_trait]
impl TenantVerifier for StaticTenantVerifier {
    async fn verify_token(
        &self,
        token: &str,
        _request_id: Option<&str>,
    ) -> Result<Tenant, TenantAdmError> {
        self.tenants
            .get(token)
            .cloned()
            .ok_or_else(|| TenantAdmError::Rejected("unknown tenant token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Seen {
        authorization: Option<String>,
        request_id: Option<String>,
    }

    async fn mock_tenantadm(status: u16, body: serde_json::Value) -> (String, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let captured = seen.clone();
        let app = Router::new().route(
            TENANT_VERIFY_URI,
            post(move |headers: HeaderMap| {
                let captured = captured.clone();
                let body = body.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    let mut seen = captured.lock().unwrap();
                    seen.authorization = header("authorization");
                    seen.request_id = header(REQUEST_ID_HEADER);
                    (StatusCode::from_u16(status).unwrap(), Json(body))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn client(base: &str) -> TenantAdmClient {
        TenantAdmClient::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        for status in [400, 406] {
            let (base, _) = mock_tenantadm(status, json!(null)).await;
            let err = client(&base).verify_token("tok", None).await.unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("token verification request returned unexpected status {}", status)
            );
        }
    }

    #[tokio::test]
    async fn test_verified() {
        let (base, seen) = mock_tenantadm(
            200,
            json!({"id": "foo", "name": "foo-name", "status": "active", "plan": "enterprise"}),
        )
        .await;

        let tenant = client(&base)
            .verify_token("tok", Some("req-1"))
            .await
            .unwrap();
        assert_eq!(
            tenant,
            Tenant {
                id: "foo".to_string(),
                name: "foo-name".to_string(),
                status: "active".to_string(),
                plan: "enterprise".to_string(),
            }
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.authorization.as_deref(), Some("Bearer tok"));
        assert_eq!(seen.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_rejected() {
        let (base, _) = mock_tenantadm(
            401,
            json!({"error": "account suspended", "request_id": "test"}),
        )
        .await;

        let err = client(&base).verify_token("tok", None).await.unwrap_err();
        assert!(matches!(err, TenantAdmError::Rejected(_)));
        assert_eq!(
            err.to_string(),
            "tenant token verification failed: account suspended"
        );
    }

    #[tokio::test]
    async fn test_transport_error() {
        // Nothing listens on the discard port.
        let err = client("http://127.0.0.1:9")
            .verify_token("tok", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TenantAdmError::Transport(_)));
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticTenantVerifier::new().with_tenant(
            "tok-a",
            Tenant {
                id: "a".to_string(),
                status: "active".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(verifier.verify_token("tok-a", None).await.unwrap().id, "a");
        assert!(verifier.verify_token("tok-b", None).await.is_err());
    }
}
