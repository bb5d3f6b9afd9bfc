use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fs;

/// Claims carried by a device token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceClaims {
    /// Token ID (matches the stored token row)
    pub jti: String,
    /// Subject (device ID)
    pub sub: String,
    pub auth_set_id: String,
    /// Tenant ID; absent in single-tenant deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// Opaque signing capability. It vouches for integrity only; business state
/// is re-checked against storage by the caller.
pub trait TokenSigner: Send + Sync {
    fn issuer(&self) -> &str;

    fn sign(&self, claims: &DeviceClaims) -> Result<String, anyhow::Error>;

    fn verify(&self, token: &str) -> Result<DeviceClaims, anyhow::Error>;
}

#[derive(Clone)]
pub struct JwtSigner {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtSigner {
    /// HS256 signer backed by a shared secret.
    pub fn from_secret(secret: &[u8], issuer: &str) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
        }
    }

    /// RS256 signer loading a PEM key pair from disk.
    pub fn from_rsa_pem_files(
        private_key_path: &str,
        public_key_path: &str,
        issuer: &str,
    ) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                private_key_path,
                e
            )
        })?;
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
            anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
        })?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        tracing::info!("JWT signer initialized with RS256 keys");

        Ok(Self {
            algorithm: Algorithm::RS256,
            encoding_key,
            decoding_key,
            issuer: issuer.to_string(),
        })
    }
}

impl TokenSigner for JwtSigner {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    fn sign(&self, claims: &DeviceClaims) -> Result<String, anyhow::Error> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode device token: {}", e))
    }

    fn verify(&self, token: &str) -> Result<DeviceClaims, anyhow::Error> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        // Expiry is exact; the stored row decides everything else.
        validation.leeway = 0;

        let data = decode::<DeviceClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid device token: {}", e))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn claims(exp_offset: Duration) -> DeviceClaims {
        let now = Utc::now();
        DeviceClaims {
            jti: "token-1".to_string(),
            sub: "device-1".to_string(),
            auth_set_id: "as-1".to_string(),
            tenant: Some("acme".to_string()),
            iss: "deviceauth".to_string(),
            iat: now.timestamp(),
            exp: (now + exp_offset).timestamp(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = JwtSigner::from_secret(b"test-secret", "deviceauth");
        let original = claims(Duration::hours(1));

        let token = signer.sign(&original).unwrap();
        assert_eq!(signer.verify(&token).unwrap(), original);
    }

    #[test]
    fn test_rejects_foreign_signature() {
        let signer = JwtSigner::from_secret(b"test-secret", "deviceauth");
        let other = JwtSigner::from_secret(b"other-secret", "deviceauth");

        let token = other.sign(&claims(Duration::hours(1))).unwrap();
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn test_rejects_expired_token() {
        let signer = JwtSigner::from_secret(b"test-secret", "deviceauth");
        let token = signer.sign(&claims(Duration::hours(-1))).unwrap();
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn test_rejects_wrong_issuer() {
        let signer = JwtSigner::from_secret(b"test-secret", "deviceauth");
        let other = JwtSigner::from_secret(b"test-secret", "someone-else");

        let mut c = claims(Duration::hours(1));
        c.iss = "someone-else".to_string();
        let token = other.sign(&c).unwrap();
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn test_missing_key_files() {
        let result = JwtSigner::from_rsa_pem_files("/nonexistent/private.pem", "/nonexistent/public.pem", "deviceauth");
        assert!(result.is_err());
    }
}
