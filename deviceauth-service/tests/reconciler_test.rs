mod common;

use chrono::{Duration, Utc};
use common::{auth_request, tenant_auth_request, TestApp, TENANT_A_TOKEN, TENANT_B_TOKEN};
use deviceauth_service::models::{AuthSet, AuthSetStatus, Device, DeviceStatus, Token};
use deviceauth_service::services::{
    AuthSetFilter, DataStore, Namespace, RequestContext, TenantId, DEFAULT_BASE_NAMESPACE,
};
use uuid::Uuid;

fn default_ns() -> Namespace {
    Namespace::default_for(DEFAULT_BASE_NAMESPACE)
}

fn token_for(device_id: &str, auth_set_id: &str) -> Token {
    Token {
        id: Uuid::new_v4().to_string(),
        device_id: device_id.to_string(),
        auth_set_id: auth_set_id.to_string(),
        token: "signed".to_string(),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        created_ts: Utc::now(),
    }
}

async fn assert_consistent(store: &dyn DataStore, ns: &Namespace) {
    assert!(store.get_devices_being_decommissioned(ns).await.unwrap().is_empty());
    assert!(store.get_broken_auth_sets(ns).await.unwrap().is_empty());
    assert!(store.get_broken_tokens(ns).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repairs_interrupted_writes() {
    let app = TestApp::spawn();
    let store = app.store();
    let ns = default_ns();

    // Healthy accepted device
    let healthy = app.submit_new(RequestContext::new(), &auth_request("ok", "ok")).await;
    let scope = app.devauth.with_context(RequestContext::new());
    let healthy_token = scope.accept_device(&healthy).await.unwrap();

    // Auth set whose device never got written
    let orphan_set = AuthSet::new("ghost".into(), "ghost".into(), "k".into(), AuthSetStatus::Pending);
    store.add_auth_set(&ns, &orphan_set).await.unwrap();

    // Reject that updated the set but never dropped the token
    let stale = app.submit_new(RequestContext::new(), &auth_request("stale", "k")).await;
    let stale_token = scope.accept_device(&stale).await.unwrap();
    store
        .update_auth_sets_status(&ns, &AuthSetFilter::device(&stale), AuthSetStatus::Rejected)
        .await
        .unwrap();

    // Token pointing at an auth set that is gone
    let dangling = token_for(&healthy, "missing-set");
    store.add_token(&ns, &dangling).await.unwrap();

    let report = app.reconciler.run_once().await.unwrap();
    assert_eq!(report.removed.devices_removed, 0);
    assert_eq!(report.removed.auth_sets_removed, 1);
    assert_eq!(report.removed.tokens_removed, 2);

    assert!(store.get_auth_set_by_id(&ns, &orphan_set.id).await.unwrap().is_none());
    assert!(store.get_token(&ns, &stale_token.id).await.unwrap().is_none());
    assert!(store.get_token(&ns, &dangling.id).await.unwrap().is_none());

    // Healthy rows survive
    assert!(store.get_token(&ns, &healthy_token.id).await.unwrap().is_some());
    assert!(app.devauth.verify_token(&healthy_token.token).await.is_ok());
    assert!(store.get_device_by_id(&ns, &stale).await.unwrap().is_some());

    assert_consistent(store, &ns).await;
}

#[tokio::test]
async fn test_pass_is_idempotent() {
    let app = TestApp::spawn();
    let store = app.store();
    let ns = default_ns();
    let scope = app.devauth.with_context(RequestContext::new());

    for i in 0..4 {
        let id = app
            .submit_new(RequestContext::new(), &auth_request(&format!("dev-{}", i), "k"))
            .await;
        scope.accept_device(&id).await.unwrap();
        if i % 2 == 0 {
            scope.decommission(&id).await.unwrap();
        }
    }

    let first = app.reconciler.run_once().await.unwrap();
    assert_eq!(first.removed.devices_removed, 2);
    assert_eq!(first.removed.auth_sets_removed, 2);
    assert_eq!(first.removed.tokens_removed, 2);
    assert_consistent(store, &ns).await;
    let remaining = store.get_devices(&ns, 0, 100).await.unwrap();

    let second = app.reconciler.run_once().await.unwrap();
    assert!(second.removed.is_empty());
    assert_eq!(store.get_devices(&ns, 0, 100).await.unwrap(), remaining);
}

#[tokio::test]
async fn test_tokens_left_alone_without_sweep() {
    let app = TestApp::spawn();
    let store = app.store();
    let ns = default_ns();

    let id = app.submit_new(RequestContext::new(), &auth_request("001", "001")).await;
    let token = app
        .devauth
        .with_context(RequestContext::new())
        .accept_device(&id)
        .await
        .unwrap();
    store
        .update_auth_sets_status(&ns, &AuthSetFilter::device(&id), AuthSetStatus::Pending)
        .await
        .unwrap();

    let report = app.reconciler.run_pass(false).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(store.get_broken_tokens(&ns).await.unwrap(), vec![token.id.clone()]);

    let report = app.reconciler.run_pass(true).await.unwrap();
    assert_eq!(report.removed.tokens_removed, 1);
}

#[tokio::test]
async fn test_decommissioning_device_keeps_other_devices() {
    let app = TestApp::spawn();
    let store = app.store();
    let ns = default_ns();

    let mut doomed = Device::new("001".into(), "k1".into(), String::new(), DeviceStatus::Accepted);
    doomed.decommissioning = true;
    store.add_device(&ns, &doomed).await.unwrap();
    let live = app.submit_new(RequestContext::new(), &auth_request("002", "k2")).await;

    // A set already pointing at the doomed device is broken before any delete
    let set = AuthSet::new(doomed.id.clone(), "001".into(), "k1".into(), AuthSetStatus::Accepted);
    store.add_auth_set(&ns, &set).await.unwrap();
    assert_eq!(store.get_broken_auth_sets(&ns).await.unwrap(), vec![set.id.clone()]);

    app.reconciler.run_once().await.unwrap();
    assert!(store.get_device_by_id(&ns, &doomed.id).await.unwrap().is_none());
    assert_eq!(
        store.get_auth_sets_for_device(&ns, &live).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_every_tenant_namespace_is_visited() {
    let app = TestApp::spawn_multi_tenant();
    let store = app.store();

    let mut doomed = Vec::new();
    for (token, tenant) in [(TENANT_A_TOKEN, "tenant-a"), (TENANT_B_TOKEN, "tenant-b")] {
        let outcome = app
            .devauth
            .submit_auth_request(RequestContext::new(), &tenant_auth_request("001", "001", token))
            .await
            .unwrap();
        let device_id = match outcome {
            deviceauth_service::dtos::AuthOutcome::NotAccepted { device_id, .. } => device_id,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let ctx = RequestContext::for_tenant(TenantId::parse(tenant).unwrap());
        let ns = Namespace::for_tenant(DEFAULT_BASE_NAMESPACE, &TenantId::parse(tenant).unwrap());
        app.devauth.with_context(ctx).decommission(&device_id).await.unwrap();
        doomed.push((ns, device_id));
    }

    let namespaces = store.list_namespaces().await.unwrap();
    assert!(namespaces.contains(&default_ns()));
    for (ns, _) in &doomed {
        assert!(namespaces.contains(ns));
    }

    let report = app.reconciler.run_once().await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(report.removed.devices_removed, 2);
    assert_eq!(report.removed.auth_sets_removed, 2);
    for (ns, device_id) in &doomed {
        assert!(store.get_device_by_id(ns, device_id).await.unwrap().is_none());
        assert_consistent(store, ns).await;
    }
}
