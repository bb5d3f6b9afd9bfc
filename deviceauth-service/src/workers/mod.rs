mod reconciler;

pub use reconciler::{NamespaceReport, ReconcileReport, Reconciler, ReconcilerConfig};
