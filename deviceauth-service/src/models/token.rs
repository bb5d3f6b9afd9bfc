use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A signed bearer credential issued to a device for one accepted auth set.
///
/// The row is the source of truth: a token without a row is revoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    #[serde(rename = "_id")]
    pub id: String,
    pub device_id: String,
    pub auth_set_id: String,
    pub token: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "super::opt_chrono_datetime_as_bson_datetime"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_ts: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}
