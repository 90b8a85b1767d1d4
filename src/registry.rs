//! Reconciler dispatch by provider kind
//!
//! A tagged table from datacenter kind to reconciler. Registration is
//! append-only through the builder; lookups for unregistered kinds are
//! logged and ignored so that clusters of a provider this process was not
//! wired for are skipped rather than failed (forward-compatible).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::provider::ProviderReconciler;
use crate::spec::DatacenterKind;

/// Dispatch table from datacenter kind to provider reconciler
#[derive(Default)]
pub struct ReconcilerRegistry {
    reconcilers: HashMap<DatacenterKind, Arc<dyn ProviderReconciler>>,
}

impl ReconcilerRegistry {
    /// Builder for a registry
    pub fn builder() -> ReconcilerRegistryBuilder {
        ReconcilerRegistryBuilder::default()
    }

    /// Reconciler for a kind; `None` is logged and means "skip this cluster"
    pub fn get(&self, kind: DatacenterKind) -> Option<Arc<dyn ProviderReconciler>> {
        let reconciler = self.reconcilers.get(&kind).cloned();
        if reconciler.is_none() {
            info!(kind = %kind, "no reconciler registered for provider kind, ignoring");
        }
        reconciler
    }

    /// Registered kinds
    pub fn kinds(&self) -> Vec<DatacenterKind> {
        self.reconcilers.keys().copied().collect()
    }
}

/// Append-only builder for [`ReconcilerRegistry`]
#[derive(Default)]
pub struct ReconcilerRegistryBuilder {
    reconcilers: HashMap<DatacenterKind, Arc<dyn ProviderReconciler>>,
}

impl ReconcilerRegistryBuilder {
    /// Register a reconciler for a kind; the first registration wins
    pub fn add(mut self, kind: DatacenterKind, reconciler: Arc<dyn ProviderReconciler>) -> Self {
        self.reconcilers.entry(kind).or_insert(reconciler);
        self
    }

    /// Build the registry
    pub fn build(self) -> ReconcilerRegistry {
        ReconcilerRegistry {
            reconcilers: self.reconcilers,
        }
    }
}
