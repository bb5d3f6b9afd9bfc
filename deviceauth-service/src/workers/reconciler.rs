use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::services::context::Namespace;
use crate::services::store::{DataStore, StoreError};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Sweep broken tokens on every Nth pass.
    pub token_sweep_every: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            token_sweep_every: 1,
        }
    }
}

/// Rows removed from one namespace in one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceReport {
    pub devices_removed: u64,
    pub auth_sets_removed: u64,
    pub tokens_removed: u64,
}

impl NamespaceReport {
    pub fn is_empty(&self) -> bool {
        self.devices_removed == 0 && self.auth_sets_removed == 0 && self.tokens_removed == 0
    }

    fn add(&mut self, other: &NamespaceReport) {
        self.devices_removed += other.devices_removed;
        self.auth_sets_removed += other.auth_sets_removed;
        self.tokens_removed += other.tokens_removed;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub namespaces: usize,
    pub failed: usize,
    pub removed: NamespaceReport,
}

/// Deletes half-decommissioned devices and the auth sets and tokens that
/// reference rows which no longer exist.
///
/// Only ever removes records; each delete re-checks the broken predicate
/// against the rows present at that moment.
pub struct Reconciler {
    store: Arc<dyn DataStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DataStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    /// Repair one namespace.
    ///
    /// Devices go first: removing them is what leaves their auth sets
    /// dangling, and those are then caught in the same pass.
    pub async fn reconcile_namespace(
        &self,
        ns: &Namespace,
        sweep_tokens: bool,
    ) -> Result<NamespaceReport, StoreError> {
        let mut report = NamespaceReport::default();

        let doomed = self.store.get_devices_being_decommissioned(ns).await?;
        if !doomed.is_empty() {
            tracing::info!(namespace = %ns, count = doomed.len(), "Removing decommissioned devices");
            report.devices_removed = self.store.delete_devices_being_decommissioned(ns).await?;
        }

        let broken_sets = self.store.get_broken_auth_sets(ns).await?;
        if !broken_sets.is_empty() {
            tracing::warn!(
                namespace = %ns,
                count = broken_sets.len(),
                auth_set_ids = ?broken_sets,
                "Broken auth sets found"
            );
            metrics::counter!("deviceauth_reconciler_inconsistent_total", "kind" => "auth_set")
                .increment(broken_sets.len() as u64);
            report.auth_sets_removed = self.store.delete_broken_auth_sets(ns).await?;
        }

        if sweep_tokens {
            let broken_tokens = self.store.get_broken_tokens(ns).await?;
            if !broken_tokens.is_empty() {
                tracing::warn!(
                    namespace = %ns,
                    count = broken_tokens.len(),
                    "Broken tokens found"
                );
                metrics::counter!("deviceauth_reconciler_inconsistent_total", "kind" => "token")
                    .increment(broken_tokens.len() as u64);
                report.tokens_removed = self.store.delete_broken_tokens(ns).await?;
            }
        }

        metrics::counter!("deviceauth_reconciler_deleted_total", "kind" => "devices")
            .increment(report.devices_removed);
        metrics::counter!("deviceauth_reconciler_deleted_total", "kind" => "auth_sets")
            .increment(report.auth_sets_removed);
        metrics::counter!("deviceauth_reconciler_deleted_total", "kind" => "tokens")
            .increment(report.tokens_removed);
        Ok(report)
    }

    /// Repair every namespace in the store.
    ///
    /// A failing namespace is logged and skipped; only failing to enumerate
    /// namespaces fails the pass.
    pub async fn run_pass(&self, sweep_tokens: bool) -> Result<ReconcileReport, StoreError> {
        let namespaces = self.store.list_namespaces().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to list namespaces");
            metrics::counter!("deviceauth_reconciler_pass_failures_total").increment(1);
            e
        })?;

        let mut report = ReconcileReport {
            namespaces: namespaces.len(),
            ..Default::default()
        };
        for ns in &namespaces {
            match self.reconcile_namespace(ns, sweep_tokens).await {
                Ok(ns_report) => report.removed.add(&ns_report),
                Err(e) => {
                    tracing::error!(namespace = %ns, error = %e, "Namespace reconciliation failed");
                    metrics::counter!("deviceauth_reconciler_namespace_failures_total")
                        .increment(1);
                    report.failed += 1;
                }
            }
        }

        metrics::counter!("deviceauth_reconciler_passes_total").increment(1);
        tracing::info!(
            namespaces = report.namespaces,
            failed = report.failed,
            devices_removed = report.removed.devices_removed,
            auth_sets_removed = report.removed.auth_sets_removed,
            tokens_removed = report.removed.tokens_removed,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// One full pass including tokens.
    pub async fn run_once(&self) -> Result<ReconcileReport, StoreError> {
        self.run_pass(true).await
    }

    /// Run passes on the configured interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                tracing::info!("Reconciler disabled by configuration");
                return;
            }

            let sweep_every = u64::from(self.config.token_sweep_every.max(1));
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pass: u64 = 0;

            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                token_sweep_every = sweep_every,
                "Starting reconciler"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sweep_tokens = pass % sweep_every == 0;
                        pass += 1;
                        // Errors are already logged and counted.
                        let _ = self.run_pass(sweep_tokens).await;
                    }
                }
            }
        })
    }
}
