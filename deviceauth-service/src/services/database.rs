//! MongoDB-backed [`DataStore`]. Each namespace is its own database.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, DateTime, Document},
    error::{ErrorKind, WriteError, WriteFailure},
    options::{AggregateOptions, FindOneOptions, FindOptions, IndexOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::models::{AuthSet, AuthSetStatus, Device, DeviceStatus, Token};
use crate::services::context::Namespace;
use crate::services::store::{AuthSetFilter, DataStore, DeviceUpdate, StoreError, TokenFilter};

const DEVICES: &str = "devices";
const AUTH_SETS: &str = "auth_sets";
const TOKENS: &str = "tokens";

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Rows re-checked and deleted per round trip during repair.
const REPAIR_BATCH_SIZE: usize = 500;

/// Optimistic attempts before a status recomputation reports contention.
const STATUS_REFRESH_ATTEMPTS: usize = 5;

pub struct MongoStore {
    client: MongoClient,
    base: String,
    indexed: Mutex<HashSet<Namespace>>,
}

impl MongoStore {
    pub async fn connect(uri: &str, base: &str) -> Result<Self, AppError> {
        tracing::info!(uri = %uri, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB at {}: {}", uri, e);
            AppError::from(e)
        })?;
        tracing::info!(base = %base, "Successfully connected to MongoDB");
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: MongoClient, base: &str) -> Self {
        Self {
            client,
            base: base.to_string(),
            indexed: Mutex::new(HashSet::new()),
        }
    }

    pub fn client(&self) -> &MongoClient {
        &self.client
    }

    /// Create the indexes of one namespace. Safe to repeat.
    pub async fn initialize_indexes(&self, ns: &Namespace) -> Result<(), StoreError> {
        tracing::info!(namespace = %ns, "Creating MongoDB indexes for deviceauth-service");

        let unique = |name: &str| {
            IndexOptions::builder()
                .name(name.to_string())
                .unique(true)
                .build()
        };
        let named = |name: &str| IndexOptions::builder().name(name.to_string()).build();

        self.database(ns)
            .collection::<Document>(DEVICES)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "id_data_sha256": 1 })
                    .options(unique("identity_unique"))
                    .build(),
                None,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to create identity index on devices collection: {}", e);
                StoreError::from(e)
            })?;

        self.database(ns)
            .collection::<Document>(AUTH_SETS)
            .create_indexes(
                vec![
                    IndexModel::builder()
                        .keys(doc! { "device_id": 1, "pub_key": 1 })
                        .options(unique("device_key_unique"))
                        .build(),
                    IndexModel::builder()
                        .keys(doc! { "device_id": 1, "status": 1 })
                        .options(named("device_status_lookup"))
                        .build(),
                ],
                None,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to create indexes on auth_sets collection: {}", e);
                StoreError::from(e)
            })?;

        self.database(ns)
            .collection::<Document>(TOKENS)
            .create_indexes(
                vec![
                    IndexModel::builder()
                        .keys(doc! { "device_id": 1 })
                        .options(named("device_lookup"))
                        .build(),
                    IndexModel::builder()
                        .keys(doc! { "auth_set_id": 1 })
                        .options(named("auth_set_lookup"))
                        .build(),
                    // Expired rows are removed by the server's TTL monitor.
                    IndexModel::builder()
                        .keys(doc! { "expires_at": 1 })
                        .options(
                            IndexOptions::builder()
                                .name("expiry_ttl".to_string())
                                .expire_after(Duration::from_secs(0))
                                .build(),
                        )
                        .build(),
                ],
                None,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to create indexes on tokens collection: {}", e);
                StoreError::from(e)
            })?;

        self.indexed
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?
            .insert(ns.clone());
        tracing::info!(namespace = %ns, "MongoDB indexes ready");
        Ok(())
    }

    async fn ensure_indexes(&self, ns: &Namespace) -> Result<(), StoreError> {
        let done = self
            .indexed
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?
            .contains(ns);
        if done {
            return Ok(());
        }
        self.initialize_indexes(ns).await
    }

    fn database(&self, ns: &Namespace) -> Database {
        self.client.database(ns.as_str())
    }

    fn devices(&self, ns: &Namespace) -> Collection<Device> {
        self.database(ns).collection(DEVICES)
    }

    fn auth_sets(&self, ns: &Namespace) -> Collection<AuthSet> {
        self.database(ns).collection(AUTH_SETS)
    }

    fn tokens(&self, ns: &Namespace) -> Collection<Token> {
        self.database(ns).collection(TOKENS)
    }

    fn raw(&self, ns: &Namespace, collection: &str) -> Collection<Document> {
        self.database(ns).collection(collection)
    }

    /// Broken rows found by `pipeline`, as (id, device id, auth set id).
    async fn repair_candidates(
        &self,
        ns: &Namespace,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<RepairCandidate>, StoreError> {
        let options = AggregateOptions::builder().allow_disk_use(true).build();
        let docs: Vec<Document> = self
            .raw(ns, collection)
            .aggregate(pipeline, options)
            .await?
            .try_collect()
            .await?;
        Ok(docs.iter().filter_map(RepairCandidate::from_document).collect())
    }

    async fn ids_among(
        &self,
        ns: &Namespace,
        collection: &str,
        ids: Vec<String>,
        condition: Document,
    ) -> Result<HashSet<String>, StoreError> {
        let mut filter = doc! { "_id": { "$in": ids } };
        for (key, value) in condition {
            filter.insert(key, value);
        }
        let found = self.raw(ns, collection).distinct("_id", filter, None).await?;
        Ok(found
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect())
    }

    async fn live_devices_among(
        &self,
        ns: &Namespace,
        ids: Vec<String>,
    ) -> Result<HashSet<String>, StoreError> {
        self.ids_among(ns, DEVICES, ids, doc! { "decommissioning": { "$ne": true } })
            .await
    }

    async fn accepted_auth_sets_among(
        &self,
        ns: &Namespace,
        ids: Vec<String>,
    ) -> Result<HashSet<String>, StoreError> {
        let accepted = doc! { "status": AuthSetStatus::Accepted.to_string() };
        self.ids_among(ns, AUTH_SETS, ids, accepted).await
    }

    async fn delete_batch(
        &self,
        ns: &Namespace,
        collection: &str,
        ids: Vec<String>,
        created_before: DateTime,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .raw(ns, collection)
            .delete_many(
                doc! { "_id": { "$in": ids }, "created_ts": { "$lt": created_before } },
                None,
            )
            .await?;
        Ok(result.deleted_count)
    }
}

/// A row flagged by a repair pipeline together with the references it was judged on.
#[derive(Debug, Clone, PartialEq)]
struct RepairCandidate {
    id: String,
    device_id: String,
    auth_set_id: Option<String>,
}

impl RepairCandidate {
    fn from_document(doc: &Document) -> Option<Self> {
        Some(Self {
            id: doc.get_str("_id").ok()?.to_string(),
            device_id: doc.get_str("device_id").ok()?.to_string(),
            auth_set_id: doc.get_str("auth_set_id").ok().map(str::to_string),
        })
    }
}

fn created_before_stage(created_before: Option<DateTime>) -> Option<Document> {
    created_before.map(|cutoff| doc! { "$match": { "created_ts": { "$lt": cutoff } } })
}

/// Auth sets whose device is missing or being decommissioned.
fn broken_auth_sets_pipeline(created_before: Option<DateTime>) -> Vec<Document> {
    created_before_stage(created_before)
        .into_iter()
        .chain([
            doc! { "$project": { "device_id": 1 } },
            doc! { "$lookup": {
                "from": DEVICES,
                "localField": "device_id",
                "foreignField": "_id",
                "as": "device",
            } },
            doc! { "$match": { "$or": [
                { "device": { "$size": 0 } },
                { "device.decommissioning": true },
            ] } },
            doc! { "$project": { "device_id": 1 } },
        ])
        .collect()
}

/// Tokens whose auth set is missing or not accepted, or whose device is
/// missing or being decommissioned.
fn broken_tokens_pipeline(created_before: Option<DateTime>) -> Vec<Document> {
    created_before_stage(created_before)
        .into_iter()
        .chain([
            doc! { "$project": { "device_id": 1, "auth_set_id": 1 } },
            doc! { "$lookup": {
                "from": AUTH_SETS,
                "localField": "auth_set_id",
                "foreignField": "_id",
                "as": "auth_set",
            } },
            doc! { "$lookup": {
                "from": DEVICES,
                "localField": "device_id",
                "foreignField": "_id",
                "as": "device",
            } },
            // `$ne` on the joined array also matches an empty join.
            doc! { "$match": { "$or": [
                { "auth_set.status": { "$ne": AuthSetStatus::Accepted.to_string() } },
                { "device": { "$size": 0 } },
                { "device.decommissioning": true },
            ] } },
            doc! { "$project": { "device_id": 1, "auth_set_id": 1 } },
        ])
        .collect()
}

fn insert_error(err: mongodb::error::Error, what: String) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(WriteError {
            code: DUPLICATE_KEY_CODE,
            ..
        })) => StoreError::Duplicate(what),
        _ => StoreError::Database(err),
    }
}

fn auth_set_filter_doc(filter: &AuthSetFilter) -> Document {
    let mut query = doc! { "device_id": filter.device_id.as_str() };
    match (&filter.id, &filter.exclude_id) {
        (Some(id), Some(excluded)) => {
            query.insert("_id", doc! { "$eq": id.as_str(), "$ne": excluded.as_str() });
        }
        (Some(id), None) => {
            query.insert("_id", id.as_str());
        }
        (None, Some(excluded)) => {
            query.insert("_id", doc! { "$ne": excluded.as_str() });
        }
        (None, None) => {}
    }
    if let Some(status) = filter.status {
        query.insert("status", status.to_string());
    }
    query
}

fn token_filter_doc(filter: &TokenFilter) -> Document {
    match filter {
        TokenFilter::Device(id) => doc! { "device_id": id.as_str() },
        TokenFilter::AuthSet(id) => doc! { "auth_set_id": id.as_str() },
    }
}

#[async_trait]
impl DataStore for MongoStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                StoreError::from(e)
            })?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let names = self.client.list_database_names(None, None).await?;
        let mut namespaces: Vec<Namespace> = names
            .iter()
            .filter_map(|name| Namespace::from_existing(&self.base, name))
            .collect();
        namespaces.push(Namespace::default_for(&self.base));
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn add_device(&self, ns: &Namespace, device: &Device) -> Result<(), StoreError> {
        self.ensure_indexes(ns).await?;
        self.devices(ns)
            .insert_one(device, None)
            .await
            .map_err(|e| insert_error(e, format!("device {}", device.id)))?;
        Ok(())
    }

    async fn get_device_by_id(
        &self,
        ns: &Namespace,
        id: &str,
    ) -> Result<Option<Device>, StoreError> {
        Ok(self.devices(ns).find_one(doc! { "_id": id }, None).await?)
    }

    async fn get_device_by_identity(
        &self,
        ns: &Namespace,
        id_data_sha256: &str,
    ) -> Result<Option<Device>, StoreError> {
        Ok(self
            .devices(ns)
            .find_one(doc! { "id_data_sha256": id_data_sha256 }, None)
            .await?)
    }

    async fn get_devices(
        &self,
        ns: &Namespace,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Device>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let options = FindOptions::builder()
            .skip(skip)
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .build();
        Ok(self
            .devices(ns)
            .find(doc! {}, options)
            .await?
            .try_collect()
            .await?)
    }

    async fn update_device(
        &self,
        ns: &Namespace,
        id: &str,
        update: &DeviceUpdate,
    ) -> Result<bool, StoreError> {
        let mut set = doc! { "updated_ts": DateTime::now() };
        if let Some(status) = update.status {
            set.insert("status", status.to_string());
        }
        if let Some(pub_key) = &update.pub_key {
            set.insert("pub_key", pub_key.as_str());
        }
        if let Some(decommissioning) = update.decommissioning {
            set.insert("decommissioning", decommissioning);
        }
        let result = self
            .devices(ns)
            .update_one(doc! { "_id": id }, doc! { "$set": set }, None)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn add_auth_set(&self, ns: &Namespace, set: &AuthSet) -> Result<(), StoreError> {
        self.ensure_indexes(ns).await?;
        self.auth_sets(ns)
            .insert_one(set, None)
            .await
            .map_err(|e| insert_error(e, format!("auth set {}", set.id)))?;
        Ok(())
    }

    async fn get_auth_set_by_id(
        &self,
        ns: &Namespace,
        id: &str,
    ) -> Result<Option<AuthSet>, StoreError> {
        Ok(self.auth_sets(ns).find_one(doc! { "_id": id }, None).await?)
    }

    async fn get_auth_set_by_key(
        &self,
        ns: &Namespace,
        device_id: &str,
        pub_key: &str,
    ) -> Result<Option<AuthSet>, StoreError> {
        Ok(self
            .auth_sets(ns)
            .find_one(doc! { "device_id": device_id, "pub_key": pub_key }, None)
            .await?)
    }

    async fn get_auth_sets_for_device(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Vec<AuthSet>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! { "created_ts": 1 })
            .build();
        Ok(self
            .auth_sets(ns)
            .find(doc! { "device_id": device_id }, options)
            .await?
            .try_collect()
            .await?)
    }

    async fn update_auth_sets_status(
        &self,
        ns: &Namespace,
        filter: &AuthSetFilter,
        status: AuthSetStatus,
    ) -> Result<u64, StoreError> {
        let mut query = auth_set_filter_doc(filter);
        // Sets already in the target status are not counted as changed.
        if filter.status.is_none() {
            query.insert("status", doc! { "$ne": status.to_string() });
        }
        let result = self
            .auth_sets(ns)
            .update_many(
                query,
                doc! { "$set": { "status": status.to_string(), "updated_ts": DateTime::now() } },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn refresh_device_status(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Option<DeviceStatus>, StoreError> {
        for _ in 0..STATUS_REFRESH_ATTEMPTS {
            let revision_only = FindOneOptions::builder()
                .projection(doc! { "status_rev": 1 })
                .build();
            let Some(current) = self
                .raw(ns, DEVICES)
                .find_one(doc! { "_id": device_id }, revision_only)
                .await?
            else {
                return Ok(None);
            };
            // A missing counter matches `null`.
            let revision = current.get("status_rev").cloned().unwrap_or(Bson::Null);

            let sets = self.get_auth_sets_for_device(ns, device_id).await?;
            let status = DeviceStatus::from_auth_sets(sets.iter().map(|s| s.status));
            let result = self
                .raw(ns, DEVICES)
                .update_one(
                    doc! { "_id": device_id, "status_rev": revision },
                    doc! {
                        "$set": { "status": status.to_string(), "updated_ts": DateTime::now() },
                        "$inc": { "status_rev": 1_i64 },
                    },
                    None,
                )
                .await?;
            if result.matched_count > 0 {
                return Ok(Some(status));
            }
            tracing::debug!(namespace = %ns, device_id, "Device status written concurrently, recomputing");
        }

        tracing::warn!(namespace = %ns, device_id, "Gave up recomputing device status");
        Err(StoreError::Contended(format!("device {}", device_id)))
    }

    async fn add_token(&self, ns: &Namespace, token: &Token) -> Result<(), StoreError> {
        self.ensure_indexes(ns).await?;
        self.tokens(ns)
            .insert_one(token, None)
            .await
            .map_err(|e| insert_error(e, format!("token {}", token.id)))?;
        Ok(())
    }

    async fn get_token(&self, ns: &Namespace, id: &str) -> Result<Option<Token>, StoreError> {
        Ok(self.tokens(ns).find_one(doc! { "_id": id }, None).await?)
    }

    async fn get_token_for_device(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Option<Token>, StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "created_ts": -1 })
            .build();
        Ok(self
            .tokens(ns)
            .find_one(doc! { "device_id": device_id }, options)
            .await?)
    }

    async fn delete_token(&self, ns: &Namespace, id: &str) -> Result<bool, StoreError> {
        let result = self.tokens(ns).delete_one(doc! { "_id": id }, None).await?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_tokens(&self, ns: &Namespace, filter: &TokenFilter) -> Result<u64, StoreError> {
        let result = self
            .tokens(ns)
            .delete_many(token_filter_doc(filter), None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn get_devices_being_decommissioned(
        &self,
        ns: &Namespace,
    ) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .devices(ns)
            .find(doc! { "decommissioning": true }, None)
            .await?
            .try_collect()
            .await?)
    }

    async fn delete_devices_being_decommissioned(&self, ns: &Namespace) -> Result<u64, StoreError> {
        let result = self
            .devices(ns)
            .delete_many(doc! { "decommissioning": true }, None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn get_broken_auth_sets(&self, ns: &Namespace) -> Result<Vec<String>, StoreError> {
        let candidates = self
            .repair_candidates(ns, AUTH_SETS, broken_auth_sets_pipeline(None))
            .await?;
        Ok(candidates.into_iter().map(|c| c.id).collect())
    }

    async fn delete_broken_auth_sets(&self, ns: &Namespace) -> Result<u64, StoreError> {
        let cutoff = DateTime::now();
        let candidates = self
            .repair_candidates(ns, AUTH_SETS, broken_auth_sets_pipeline(Some(cutoff)))
            .await?;

        let mut deleted = 0;
        for batch in candidates.chunks(REPAIR_BATCH_SIZE) {
            let live = self
                .live_devices_among(ns, batch.iter().map(|c| c.device_id.clone()).collect())
                .await?;
            let doomed = batch
                .iter()
                .filter(|c| !live.contains(&c.device_id))
                .map(|c| c.id.clone())
                .collect();
            deleted += self.delete_batch(ns, AUTH_SETS, doomed, cutoff).await?;
        }
        Ok(deleted)
    }

    async fn get_broken_tokens(&self, ns: &Namespace) -> Result<Vec<String>, StoreError> {
        let candidates = self
            .repair_candidates(ns, TOKENS, broken_tokens_pipeline(None))
            .await?;
        Ok(candidates.into_iter().map(|c| c.id).collect())
    }

    async fn delete_broken_tokens(&self, ns: &Namespace) -> Result<u64, StoreError> {
        let cutoff = DateTime::now();
        let candidates = self
            .repair_candidates(ns, TOKENS, broken_tokens_pipeline(Some(cutoff)))
            .await?;

        let mut deleted = 0;
        for batch in candidates.chunks(REPAIR_BATCH_SIZE) {
            let live = self
                .live_devices_among(ns, batch.iter().map(|c| c.device_id.clone()).collect())
                .await?;
            let accepted = self
                .accepted_auth_sets_among(
                    ns,
                    batch.iter().filter_map(|c| c.auth_set_id.clone()).collect(),
                )
                .await?;
            let doomed = batch
                .iter()
                .filter(|c| {
                    !live.contains(&c.device_id)
                        || !c.auth_set_id.as_ref().is_some_and(|id| accepted.contains(id))
                })
                .map(|c| c.id.clone())
                .collect();
            deleted += self.delete_batch(ns, TOKENS, doomed, cutoff).await?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_set_filter_doc() {
        let filter = AuthSetFilter::device("dev-1")
            .status(AuthSetStatus::Accepted)
            .excluding("as-1");
        assert_eq!(
            auth_set_filter_doc(&filter),
            doc! { "device_id": "dev-1", "_id": { "$ne": "as-1" }, "status": "accepted" }
        );

        let filter = AuthSetFilter::device("dev-1").id("as-2");
        assert_eq!(
            auth_set_filter_doc(&filter),
            doc! { "device_id": "dev-1", "_id": "as-2" }
        );
    }

    #[test]
    fn test_token_filter_doc() {
        assert_eq!(
            token_filter_doc(&TokenFilter::Device("dev-1".into())),
            doc! { "device_id": "dev-1" }
        );
        assert_eq!(
            token_filter_doc(&TokenFilter::AuthSet("as-1".into())),
            doc! { "auth_set_id": "as-1" }
        );
    }

    #[test]
    fn test_repair_pipelines_respect_cutoff() {
        let cutoff = DateTime::now();
        for pipeline in [
            broken_auth_sets_pipeline(Some(cutoff)),
            broken_tokens_pipeline(Some(cutoff)),
        ] {
            assert_eq!(
                pipeline[0],
                doc! { "$match": { "created_ts": { "$lt": cutoff } } }
            );
        }

        // Detection alone judges every row
        let filters_on_age = |pipeline: Vec<Document>| {
            pipeline.iter().any(|stage| {
                stage
                    .get_document("$match")
                    .is_ok_and(|m| m.contains_key("created_ts"))
            })
        };
        assert!(!filters_on_age(broken_auth_sets_pipeline(None)));
        assert!(!filters_on_age(broken_tokens_pipeline(None)));
    }

    #[test]
    fn test_broken_tokens_pipeline_joins_both_parents() {
        let pipeline = broken_tokens_pipeline(None);
        let lookups: Vec<&str> = pipeline
            .iter()
            .filter_map(|stage| stage.get_document("$lookup").ok())
            .filter_map(|lookup| lookup.get_str("from").ok())
            .collect();
        assert_eq!(lookups, vec![AUTH_SETS, DEVICES]);
    }

    #[test]
    fn test_repair_candidate_from_document() {
        let token = doc! { "_id": "t1", "device_id": "d1", "auth_set_id": "a1" };
        assert_eq!(
            RepairCandidate::from_document(&token),
            Some(RepairCandidate {
                id: "t1".into(),
                device_id: "d1".into(),
                auth_set_id: Some("a1".into()),
            })
        );
        let set = doc! { "_id": "a1", "device_id": "d1" };
        assert_eq!(RepairCandidate::from_document(&set).unwrap().auth_set_id, None);
        assert_eq!(RepairCandidate::from_document(&doc! { "_id": "x" }), None);
    }
}
