use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id_data_digest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuthSetStatus {
    Pending,
    Accepted,
    Rejected,
    Preauthorized,
}

impl std::fmt::Display for AuthSetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthSetStatus::Pending => write!(f, "pending"),
            AuthSetStatus::Accepted => write!(f, "accepted"),
            AuthSetStatus::Rejected => write!(f, "rejected"),
            AuthSetStatus::Preauthorized => write!(f, "preauthorized"),
        }
    }
}

/// One (identity, public key) authentication attempt of a device.
///
/// `device_id` is a plain reference; an auth set whose device is gone or
/// being decommissioned is broken and left for the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSet {
    #[serde(rename = "_id")]
    pub id: String,
    pub device_id: String,
    pub id_data: String,
    pub id_data_sha256: String,
    pub pub_key: String,
    pub status: AuthSetStatus,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_ts: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_ts: DateTime<Utc>,
}

impl AuthSet {
    pub fn new(device_id: String, id_data: String, pub_key: String, status: AuthSetStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            id_data_sha256: id_data_digest(&id_data),
            id_data,
            pub_key,
            status,
            created_ts: now,
            updated_ts: now,
        }
    }
}
