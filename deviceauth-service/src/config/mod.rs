use service_core::config::{self as core_config, get_env, get_env_parsed, is_prod};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

use crate::services::{DEFAULT_BASE_NAMESPACE, DEFAULT_TOKEN_EXPIRY_SECONDS};
use crate::workers::ReconcilerConfig;

#[derive(Debug, Clone)]
pub struct DeviceAuthConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub mongodb: MongoConfig,
    pub jwt: JwtConfig,
    /// Present only in multi-tenant deployments.
    pub tenantadm: Option<TenantAdmConfig>,
    pub reconciler: ReconcilerConfig,
    pub otlp_endpoint: String,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    /// Database of the default namespace; tenant databases derive from it.
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub key: JwtKey,
    pub issuer: String,
    pub expiry_seconds: i64,
}

#[derive(Clone, PartialEq, Eq)]
pub enum JwtKey {
    Secret(String),
    RsaPem {
        private_key_path: String,
        public_key_path: String,
    },
}

impl std::fmt::Debug for JwtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtKey::Secret(_) => f.write_str("Secret(<redacted>)"),
            JwtKey::RsaPem {
                private_key_path,
                public_key_path,
            } => f
                .debug_struct("RsaPem")
                .field("private_key_path", private_key_path)
                .field("public_key_path", public_key_path)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantAdmConfig {
    pub addr: String,
    pub timeout: Duration,
}

impl DeviceAuthConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common = core_config::Config::load()?;
        let is_prod = is_prod();

        let tenantadm = match env::var("TENANTADM_ADDR").ok().filter(|a| !a.is_empty()) {
            Some(addr) => Some(TenantAdmConfig {
                addr,
                timeout: Duration::from_secs(get_env_parsed(
                    "TENANTADM_TIMEOUT_SECONDS",
                    "10",
                    false,
                )?),
            }),
            None => None,
        };

        Ok(DeviceAuthConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("deviceauth-service"), false)?,
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some(DEFAULT_BASE_NAMESPACE), is_prod)?,
            },
            jwt: JwtConfig {
                key: jwt_key(
                    env::var("JWT_SECRET").ok(),
                    env::var("JWT_PRIVATE_KEY_PATH").ok(),
                    env::var("JWT_PUBLIC_KEY_PATH").ok(),
                )?,
                issuer: get_env("JWT_ISSUER", Some("deviceauth"), false)?,
                expiry_seconds: get_env_parsed(
                    "JWT_EXPIRY_SECONDS",
                    &DEFAULT_TOKEN_EXPIRY_SECONDS.to_string(),
                    false,
                )?,
            },
            tenantadm,
            reconciler: ReconcilerConfig {
                enabled: get_env_parsed("RECONCILER_ENABLED", "true", false)?,
                interval: Duration::from_secs(get_env_parsed(
                    "RECONCILER_INTERVAL_SECONDS",
                    "3600",
                    false,
                )?),
                token_sweep_every: get_env_parsed("RECONCILER_TOKEN_SWEEP_EVERY", "1", false)?,
            },
            otlp_endpoint: get_env("OTLP_ENDPOINT", Some("http://tempo:4317"), false)?,
        })
    }
}

/// RS256 key files take precedence over a shared secret.
fn jwt_key(
    secret: Option<String>,
    private_key_path: Option<String>,
    public_key_path: Option<String>,
) -> Result<JwtKey, AppError> {
    match (private_key_path, public_key_path, secret) {
        (Some(private_key_path), Some(public_key_path), _) => Ok(JwtKey::RsaPem {
            private_key_path,
            public_key_path,
        }),
        (Some(_), None, _) | (None, Some(_), _) => Err(AppError::ConfigError(anyhow::anyhow!(
            "JWT_PRIVATE_KEY_PATH and JWT_PUBLIC_KEY_PATH must be set together"
        ))),
        (None, None, Some(secret)) if !secret.is_empty() => Ok(JwtKey::Secret(secret)),
        (None, None, _) => Err(AppError::ConfigError(anyhow::anyhow!(
            "JWT_SECRET or JWT_PRIVATE_KEY_PATH/JWT_PUBLIC_KEY_PATH is required"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_key_selection() {
        assert_eq!(
            jwt_key(Some("s3cret".into()), None, None).unwrap(),
            JwtKey::Secret("s3cret".into())
        );
        assert_eq!(
            jwt_key(Some("s3cret".into()), Some("priv.pem".into()), Some("pub.pem".into()))
                .unwrap(),
            JwtKey::RsaPem {
                private_key_path: "priv.pem".into(),
                public_key_path: "pub.pem".into(),
            }
        );
        assert!(jwt_key(None, Some("priv.pem".into()), None).is_err());
        assert!(jwt_key(Some(String::new()), None, None).is_err());
        assert!(jwt_key(None, None, None).is_err());
    }

    #[test]
    fn test_secret_is_redacted() {
        let shown = format!("{:?}", JwtKey::Secret("s3cret".into()));
        assert!(!shown.contains("s3cret"));
    }
}
