use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AuthSetStatus;

/// Aggregate status of a device, derived from its auth sets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Accepted,
    Rejected,
    Preauthorized,
    Noauth,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Pending => write!(f, "pending"),
            DeviceStatus::Accepted => write!(f, "accepted"),
            DeviceStatus::Rejected => write!(f, "rejected"),
            DeviceStatus::Preauthorized => write!(f, "preauthorized"),
            DeviceStatus::Noauth => write!(f, "noauth"),
        }
    }
}

impl DeviceStatus {
    /// Derive the device status from the statuses of all its auth sets.
    ///
    /// Precedence is accepted, preauthorized, pending; a device whose sets are
    /// all rejected is rejected, and one without any set is `noauth`.
    pub fn from_auth_sets<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = AuthSetStatus>,
    {
        let mut any = false;
        let mut accepted = false;
        let mut preauthorized = false;
        let mut pending = false;

        for status in statuses {
            any = true;
            match status {
                AuthSetStatus::Accepted => accepted = true,
                AuthSetStatus::Preauthorized => preauthorized = true,
                AuthSetStatus::Pending => pending = true,
                AuthSetStatus::Rejected => {}
            }
        }

        if !any {
            DeviceStatus::Noauth
        } else if accepted {
            DeviceStatus::Accepted
        } else if preauthorized {
            DeviceStatus::Preauthorized
        } else if pending {
            DeviceStatus::Pending
        } else {
            DeviceStatus::Rejected
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub tenant_token: String,
    pub id_data: String,
    pub id_data_sha256: String,
    pub pub_key: String,
    pub status: DeviceStatus,
    #[serde(default)]
    pub decommissioning: bool,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_ts: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_ts: DateTime<Utc>,
}

impl Device {
    pub fn new(id_data: String, pub_key: String, tenant_token: String, status: DeviceStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_token,
            id_data_sha256: id_data_digest(&id_data),
            id_data,
            pub_key,
            status,
            decommissioning: false,
            created_ts: now,
            updated_ts: now,
        }
    }
}

/// Hex SHA-256 of a device identity payload.
///
/// JSON objects are re-serialized with sorted keys first so that the same
/// attributes in a different order map to the same identity. Anything that
/// is not a JSON object is hashed verbatim.
pub fn id_data_digest(id_data: &str) -> String {
    let canonical = match serde_json::from_str::<serde_json::Value>(id_data) {
        Ok(value @ serde_json::Value::Object(_)) => sorted_keys(&value).to_string(),
        _ => id_data.to_string(),
    };
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

// Map ordering depends on serde_json's `preserve_order` feature, so sort explicitly.
fn sorted_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sorted_keys).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aggregation() {
        use AuthSetStatus::*;

        assert_eq!(DeviceStatus::from_auth_sets([]), DeviceStatus::Noauth);
        assert_eq!(
            DeviceStatus::from_auth_sets([Pending, Accepted, Rejected]),
            DeviceStatus::Accepted
        );
        assert_eq!(
            DeviceStatus::from_auth_sets([Rejected, Rejected]),
            DeviceStatus::Rejected
        );
        assert_eq!(
            DeviceStatus::from_auth_sets([Rejected, Pending]),
            DeviceStatus::Pending
        );
        assert_eq!(
            DeviceStatus::from_auth_sets([Pending, Preauthorized]),
            DeviceStatus::Preauthorized
        );
    }

    #[test]
    fn test_id_data_digest_ignores_key_order() {
        let a = id_data_digest(r#"{"mac":"00:11","sku":"x1"}"#);
        let b = id_data_digest(r#"{"sku":"x1","mac":"00:11"}"#);
        assert_eq!(a, b);
        assert_ne!(a, id_data_digest(r#"{"mac":"00:12","sku":"x1"}"#));
    }

    #[test]
    fn test_id_data_digest_opaque_payload() {
        assert_eq!(id_data_digest("001"), id_data_digest("001"));
        assert_ne!(id_data_digest("001"), id_data_digest("002"));
        assert_eq!(id_data_digest("001").len(), 64);
    }
}
