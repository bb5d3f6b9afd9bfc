mod auth_set;
mod device;
mod tenant;
mod token;

pub use auth_set::{AuthSet, AuthSetStatus};
pub use device::{id_data_digest, Device, DeviceStatus};
pub use tenant::{Tenant, TENANT_STATUS_SUSPENDED};
pub use token::Token;

// Helper module for optional DateTime<Utc> as BSON DateTime
pub(crate) mod opt_chrono_datetime_as_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt.map(|dt| dt.to_chrono()))
    }
}
