//! In-process [`DataStore`] used by tests and for local runs without MongoDB.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::models::{AuthSet, AuthSetStatus, Device, DeviceStatus, Token};
use crate::services::context::Namespace;
use crate::services::store::{AuthSetFilter, DataStore, DeviceUpdate, StoreError, TokenFilter};

#[derive(Default)]
struct Partition {
    devices: Vec<Device>,
    auth_sets: Vec<AuthSet>,
    tokens: Vec<Token>,
}

impl Partition {
    fn live_device_ids(&self) -> HashSet<&str> {
        self.devices
            .iter()
            .filter(|d| !d.decommissioning)
            .map(|d| d.id.as_str())
            .collect()
    }

    fn broken_auth_set_ids(&self) -> Vec<String> {
        let live = self.live_device_ids();
        self.auth_sets
            .iter()
            .filter(|s| !live.contains(s.device_id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }

    fn broken_token_ids(&self) -> Vec<String> {
        let live = self.live_device_ids();
        let accepted: HashSet<&str> = self
            .auth_sets
            .iter()
            .filter(|s| s.status == AuthSetStatus::Accepted)
            .map(|s| s.id.as_str())
            .collect();
        self.tokens
            .iter()
            .filter(|t| {
                !accepted.contains(t.auth_set_id.as_str()) || !live.contains(t.device_id.as_str())
            })
            .map(|t| t.id.clone())
            .collect()
    }
}

pub struct MemoryStore {
    base: String,
    partitions: Mutex<HashMap<Namespace, Partition>>,
}

impl MemoryStore {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Namespace, Partition>>, StoreError> {
        self.partitions
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn read<R>(&self, ns: &Namespace, f: impl FnOnce(&Partition) -> R) -> Result<R, StoreError> {
        let guard = self.lock()?;
        let empty = Partition::default();
        Ok(f(guard.get(ns).unwrap_or(&empty)))
    }

    /// Mutate an existing partition. An unknown namespace is never created.
    fn write<R>(
        &self,
        ns: &Namespace,
        f: impl FnOnce(&mut Partition) -> R,
    ) -> Result<R, StoreError> {
        let mut guard = self.lock()?;
        match guard.get_mut(ns) {
            Some(partition) => Ok(f(partition)),
            None => Ok(f(&mut Partition::default())),
        }
    }

    /// Add a row, creating the partition only when the insert succeeds.
    fn insert(
        &self,
        ns: &Namespace,
        f: impl FnOnce(&mut Partition) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        if let Some(partition) = guard.get_mut(ns) {
            return f(partition);
        }
        let mut partition = Partition::default();
        f(&mut partition)?;
        guard.insert(ns.clone(), partition);
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let guard = self.lock()?;
        let mut namespaces: Vec<Namespace> = guard.keys().cloned().collect();
        namespaces.push(Namespace::default_for(&self.base));
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn add_device(&self, ns: &Namespace, device: &Device) -> Result<(), StoreError> {
        self.insert(ns, |p| {
            if p.devices
                .iter()
                .any(|d| d.id == device.id || d.id_data_sha256 == device.id_data_sha256)
            {
                return Err(StoreError::Duplicate(format!("device {}", device.id)));
            }
            p.devices.push(device.clone());
            Ok(())
        })
    }

    async fn get_device_by_id(
        &self,
        ns: &Namespace,
        id: &str,
    ) -> Result<Option<Device>, StoreError> {
        self.read(ns, |p| p.devices.iter().find(|d| d.id == id).cloned())
    }

    async fn get_device_by_identity(
        &self,
        ns: &Namespace,
        id_data_sha256: &str,
    ) -> Result<Option<Device>, StoreError> {
        self.read(ns, |p| {
            p.devices
                .iter()
                .find(|d| d.id_data_sha256 == id_data_sha256)
                .cloned()
        })
    }

    async fn get_devices(
        &self,
        ns: &Namespace,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Device>, StoreError> {
        self.read(ns, |p| {
            p.devices
                .iter()
                .skip(skip as usize)
                .take(limit as usize)
                .cloned()
                .collect()
        })
    }

    async fn update_device(
        &self,
        ns: &Namespace,
        id: &str,
        update: &DeviceUpdate,
    ) -> Result<bool, StoreError> {
        self.write(ns, |p| match p.devices.iter_mut().find(|d| d.id == id) {
            Some(device) => {
                if let Some(status) = update.status {
                    device.status = status;
                }
                if let Some(pub_key) = &update.pub_key {
                    device.pub_key = pub_key.clone();
                }
                if let Some(decommissioning) = update.decommissioning {
                    device.decommissioning = decommissioning;
                }
                device.updated_ts = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn add_auth_set(&self, ns: &Namespace, set: &AuthSet) -> Result<(), StoreError> {
        self.insert(ns, |p| {
            if p.auth_sets.iter().any(|s| {
                s.id == set.id || (s.device_id == set.device_id && s.pub_key == set.pub_key)
            }) {
                return Err(StoreError::Duplicate(format!("auth set {}", set.id)));
            }
            p.auth_sets.push(set.clone());
            Ok(())
        })
    }

    async fn get_auth_set_by_id(
        &self,
        ns: &Namespace,
        id: &str,
    ) -> Result<Option<AuthSet>, StoreError> {
        self.read(ns, |p| p.auth_sets.iter().find(|s| s.id == id).cloned())
    }

    async fn get_auth_set_by_key(
        &self,
        ns: &Namespace,
        device_id: &str,
        pub_key: &str,
    ) -> Result<Option<AuthSet>, StoreError> {
        self.read(ns, |p| {
            p.auth_sets
                .iter()
                .find(|s| s.device_id == device_id && s.pub_key == pub_key)
                .cloned()
        })
    }

    async fn get_auth_sets_for_device(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Vec<AuthSet>, StoreError> {
        self.read(ns, |p| {
            let mut sets: Vec<AuthSet> = p
                .auth_sets
                .iter()
                .filter(|s| s.device_id == device_id)
                .cloned()
                .collect();
            sets.sort_by_key(|s| s.created_ts);
            sets
        })
    }

    async fn update_auth_sets_status(
        &self,
        ns: &Namespace,
        filter: &AuthSetFilter,
        status: AuthSetStatus,
    ) -> Result<u64, StoreError> {
        self.write(ns, |p| {
            let now = Utc::now();
            let mut changed = 0;
            for set in p.auth_sets.iter_mut().filter(|s| filter.matches(s)) {
                if set.status != status {
                    set.status = status;
                    set.updated_ts = now;
                    changed += 1;
                }
            }
            changed
        })
    }

    async fn refresh_device_status(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Option<DeviceStatus>, StoreError> {
        self.write(ns, |p| {
            let status = DeviceStatus::from_auth_sets(
                p.auth_sets
                    .iter()
                    .filter(|s| s.device_id == device_id)
                    .map(|s| s.status),
            );
            let device = p.devices.iter_mut().find(|d| d.id == device_id)?;
            device.status = status;
            device.updated_ts = Utc::now();
            Some(status)
        })
    }

    async fn add_token(&self, ns: &Namespace, token: &Token) -> Result<(), StoreError> {
        self.insert(ns, |p| {
            if p.tokens.iter().any(|t| t.id == token.id) {
                return Err(StoreError::Duplicate(format!("token {}", token.id)));
            }
            p.tokens.push(token.clone());
            Ok(())
        })
    }

    async fn get_token(&self, ns: &Namespace, id: &str) -> Result<Option<Token>, StoreError> {
        self.read(ns, |p| p.tokens.iter().find(|t| t.id == id).cloned())
    }

    async fn get_token_for_device(
        &self,
        ns: &Namespace,
        device_id: &str,
    ) -> Result<Option<Token>, StoreError> {
        self.read(ns, |p| {
            p.tokens
                .iter()
                .filter(|t| t.device_id == device_id)
                .max_by_key(|t| t.created_ts)
                .cloned()
        })
    }

    async fn delete_token(&self, ns: &Namespace, id: &str) -> Result<bool, StoreError> {
        self.write(ns, |p| {
            let before = p.tokens.len();
            p.tokens.retain(|t| t.id != id);
            p.tokens.len() != before
        })
    }

    async fn delete_tokens(&self, ns: &Namespace, filter: &TokenFilter) -> Result<u64, StoreError> {
        self.write(ns, |p| {
            let before = p.tokens.len();
            p.tokens.retain(|t| !filter.matches(t));
            (before - p.tokens.len()) as u64
        })
    }

    async fn get_devices_being_decommissioned(
        &self,
        ns: &Namespace,
    ) -> Result<Vec<Device>, StoreError> {
        self.read(ns, |p| {
            p.devices
                .iter()
                .filter(|d| d.decommissioning)
                .cloned()
                .collect()
        })
    }

    async fn delete_devices_being_decommissioned(&self, ns: &Namespace) -> Result<u64, StoreError> {
        self.write(ns, |p| {
            let before = p.devices.len();
            p.devices.retain(|d| !d.decommissioning);
            (before - p.devices.len()) as u64
        })
    }

    async fn get_broken_auth_sets(&self, ns: &Namespace) -> Result<Vec<String>, StoreError> {
        self.read(ns, Partition::broken_auth_set_ids)
    }

    async fn delete_broken_auth_sets(&self, ns: &Namespace) -> Result<u64, StoreError> {
        self.write(ns, |p| {
            let broken: HashSet<String> = p.broken_auth_set_ids().into_iter().collect();
            p.auth_sets.retain(|s| !broken.contains(&s.id));
            broken.len() as u64
        })
    }

    async fn get_broken_tokens(&self, ns: &Namespace) -> Result<Vec<String>, StoreError> {
        self.read(ns, Partition::broken_token_ids)
    }

    async fn delete_broken_tokens(&self, ns: &Namespace) -> Result<u64, StoreError> {
        self.write(ns, |p| {
            let broken: HashSet<String> = p.broken_token_ids().into_iter().collect();
            p.tokens.retain(|t| !broken.contains(&t.id));
            broken.len() as u64
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::context::{TenantId, DEFAULT_BASE_NAMESPACE};

    const DEV_1: &str = "00000000-0000-4000-8000-000000000001";
    const DEV_2: &str = "00000000-0000-4000-8000-000000000002";
    const DEV_3: &str = "00000000-0000-4000-8000-000000000003";

    fn device(id: &str, id_data: &str, decommissioning: bool) -> Device {
        let mut d = Device::new(
            id_data.to_string(),
            id_data.to_string(),
            String::new(),
            DeviceStatus::Pending,
        );
        d.id = id.to_string();
        d.decommissioning = decommissioning;
        d
    }

    fn auth_set(id: &str, device_id: &str, pub_key: &str) -> AuthSet {
        let mut s = AuthSet::new(
            device_id.to_string(),
            "001".to_string(),
            pub_key.to_string(),
            AuthSetStatus::Pending,
        );
        s.id = id.to_string();
        s
    }

    fn namespaces() -> Vec<Namespace> {
        vec![
            Namespace::default_for(DEFAULT_BASE_NAMESPACE),
            Namespace::for_tenant(DEFAULT_BASE_NAMESPACE, &TenantId::parse("foo").unwrap()),
        ]
    }

    async fn seed(store: &MemoryStore, ns: &Namespace, devices: &[Device], sets: &[AuthSet]) {
        for d in devices {
            store.add_device(ns, d).await.unwrap();
        }
        for s in sets {
            store.add_auth_set(ns, s).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_get_devices_being_decommissioned() {
        for ns in namespaces() {
            let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
            seed(
                &store,
                &ns,
                &[device(DEV_1, "001", false), device(DEV_2, "002", true)],
                &[],
            )
            .await;

            let devs = store.get_devices_being_decommissioned(&ns).await.unwrap();
            assert_eq!(devs.len(), 1);
            assert_eq!(devs[0].id, DEV_2);
        }
    }

    #[tokio::test]
    async fn test_delete_devices_being_decommissioned() {
        for ns in namespaces() {
            let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
            seed(
                &store,
                &ns,
                &[device(DEV_1, "001", false), device(DEV_2, "002", true)],
                &[],
            )
            .await;

            assert_eq!(store.delete_devices_being_decommissioned(&ns).await.unwrap(), 1);
            let devs = store.get_devices(&ns, 0, 5).await.unwrap();
            assert_eq!(devs.len(), 1);
            assert!(devs.iter().all(|d| !d.decommissioning));

            // nothing left to delete
            assert_eq!(store.delete_devices_being_decommissioned(&ns).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_get_broken_auth_sets() {
        struct Case {
            devices: Vec<Device>,
            sets: Vec<AuthSet>,
            broken: Vec<&'static str>,
        }

        let cases = vec![
            // dangling device reference
            Case {
                devices: vec![device(DEV_1, "001", false), device(DEV_2, "002", false)],
                sets: vec![auth_set(DEV_1, DEV_1, "001"), auth_set(DEV_2, DEV_3, "002")],
                broken: vec![DEV_2],
            },
            // device being decommissioned
            Case {
                devices: vec![device(DEV_1, "001", false), device(DEV_2, "002", true)],
                sets: vec![auth_set(DEV_1, DEV_1, "001"), auth_set(DEV_2, DEV_2, "002")],
                broken: vec![DEV_2],
            },
        ];

        for ns in namespaces() {
            for case in &cases {
                let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
                seed(&store, &ns, &case.devices, &case.sets).await;

                let broken = store.get_broken_auth_sets(&ns).await.unwrap();
                assert_eq!(broken, case.broken);
            }
        }
    }

    #[tokio::test]
    async fn test_delete_broken_auth_sets() {
        for ns in namespaces() {
            let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
            seed(
                &store,
                &ns,
                &[device(DEV_1, "001", false), device(DEV_2, "002", true)],
                &[auth_set(DEV_1, DEV_1, "001"), auth_set(DEV_2, DEV_2, "002")],
            )
            .await;

            assert_eq!(store.delete_broken_auth_sets(&ns).await.unwrap(), 1);
            assert!(store.get_broken_auth_sets(&ns).await.unwrap().is_empty());
            assert!(store.get_auth_set_by_id(&ns, DEV_1).await.unwrap().is_some());
            assert_eq!(store.delete_broken_auth_sets(&ns).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_broken_auth_set_pointing_at_other_tenant() {
        let [default_ns, tenant_ns] = namespaces().try_into().unwrap();
        let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);

        seed(&store, &default_ns, &[device(DEV_1, "001", false)], &[]).await;
        seed(&store, &tenant_ns, &[], &[auth_set(DEV_1, DEV_1, "001")]).await;

        assert_eq!(
            store.get_broken_auth_sets(&tenant_ns).await.unwrap(),
            vec![DEV_1]
        );
        assert!(store.get_broken_auth_sets(&default_ns).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_tokens() {
        let ns = Namespace::default_for(DEFAULT_BASE_NAMESPACE);
        let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);

        let mut accepted = auth_set("as-1", DEV_1, "001");
        accepted.status = AuthSetStatus::Accepted;
        let pending = auth_set("as-2", DEV_1, "002");
        seed(&store, &ns, &[device(DEV_1, "001", false)], &[accepted, pending]).await;

        let token = |id: &str, device_id: &str, auth_set_id: &str| Token {
            id: id.to_string(),
            device_id: device_id.to_string(),
            auth_set_id: auth_set_id.to_string(),
            token: "signed".to_string(),
            expires_at: None,
            created_ts: Utc::now(),
        };
        for t in [
            token("t-ok", DEV_1, "as-1"),
            token("t-pending", DEV_1, "as-2"),
            token("t-missing-set", DEV_1, "as-9"),
            token("t-missing-dev", DEV_3, "as-1"),
        ] {
            store.add_token(&ns, &t).await.unwrap();
        }

        let mut broken = store.get_broken_tokens(&ns).await.unwrap();
        broken.sort();
        assert_eq!(broken, vec!["t-missing-dev", "t-missing-set", "t-pending"]);

        assert_eq!(store.delete_broken_tokens(&ns).await.unwrap(), 3);
        assert!(store.get_token(&ns, "t-ok").await.unwrap().is_some());
        assert_eq!(store.delete_broken_tokens(&ns).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let ns = Namespace::default_for(DEFAULT_BASE_NAMESPACE);
        let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
        store.add_device(&ns, &device(DEV_1, "001", false)).await.unwrap();

        let err = store
            .add_device(&ns, &device(DEV_2, "001", false))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_list_namespaces_includes_default() {
        let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
        let [default_ns, tenant_ns] = namespaces().try_into().unwrap();
        assert_eq!(store.list_namespaces().await.unwrap(), vec![default_ns.clone()]);

        seed(&store, &tenant_ns, &[device(DEV_1, "001", false)], &[]).await;
        let listed = store.list_namespaces().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&default_ns));
        assert!(listed.contains(&tenant_ns));
    }

    #[tokio::test]
    async fn test_writes_to_unknown_namespace_create_nothing() {
        let store = MemoryStore::new(DEFAULT_BASE_NAMESPACE);
        let [_, tenant_ns] = namespaces().try_into().unwrap();
        let update = DeviceUpdate {
            decommissioning: Some(true),
            ..Default::default()
        };

        assert!(!store.update_device(&tenant_ns, DEV_1, &update).await.unwrap());
        assert_eq!(store.refresh_device_status(&tenant_ns, DEV_1).await.unwrap(), None);
        assert!(!store.delete_token(&tenant_ns, DEV_1).await.unwrap());
        assert_eq!(store.delete_broken_auth_sets(&tenant_ns).await.unwrap(), 0);
        assert_eq!(store.list_namespaces().await.unwrap().len(), 1);

        seed(&store, &tenant_ns, &[device(DEV_1, "001", false)], &[]).await;
        assert_eq!(store.list_namespaces().await.unwrap().len(), 2);
    }
}
