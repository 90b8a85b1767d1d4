//! foundry - Kubernetes cluster lifecycle manager for on-premises
//! infrastructure
//!
//! foundry creates, upgrades, scales, moves, and deletes Kubernetes clusters
//! by driving a Cluster-API-style control plane: it renders
//! provider-specific machine and infrastructure templates from a declarative
//! cluster spec, applies them to a bootstrap or management cluster, and
//! reconciles observed state against desired state under partial failure.
//!
//! # Architecture
//!
//! - Template names are the rotation signal: a fresh timestamp suffix rolls
//!   the nodes referencing a template, a preserved name keeps them.
//! - One reconciliation per cluster runs at a time; different clusters
//!   reconcile in parallel.
//! - Recovery is forward-only: failed operations surface once on status and
//!   are retried by the next reconcile tick.
//!
//! # Modules
//!
//! - [`spec`] - typed cluster spec model and validation
//! - [`template`] - deterministic CAPI manifest rendering
//! - [`provider`] - per-provider reconcilers and operation detection
//! - [`lifecycle`] - create/upgrade/move/backup/delete orchestration
//! - [`hardware`] - bare-metal inventory catalogue and validation
//! - [`client`] - retrying capability surface over the Kubernetes API
//! - [`capi`] - typed views of consumed CAPI objects
//! - [`registry`] - provider-kind reconciler dispatch
//! - [`factory`] - lazy, idempotent dependency assembly
//! - [`controller`] - single-flight reconcile shell
//! - [`features`] - process-wide feature gates
//! - [`config`] - environment credential contracts
//! - [`error`] - error taxonomy

#![deny(missing_docs)]

pub mod capi;
pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod features;
pub mod hardware;
pub mod lifecycle;
pub mod manifest;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod spec;
pub mod template;

pub use error::{Error, ErrorCategory};

/// Result type alias using the crate error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding every object the system applies to a management cluster
pub const SYSTEM_NAMESPACE: &str = "eksa-system";

/// Handle to a cluster the orchestrator drives
///
/// Carries the identity plus the kubeconfig used to reach it; `None` means
/// the ambient (in-cluster or default) configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterHandle {
    /// Cluster name
    pub name: String,
    /// Path to the kubeconfig for this cluster
    pub kubeconfig_path: Option<std::path::PathBuf>,
}

impl ClusterHandle {
    /// Handle using the ambient kube configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kubeconfig_path: None,
        }
    }

    /// Attach a kubeconfig path
    pub fn with_kubeconfig(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.kubeconfig_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_handle_defaults_to_ambient_config() {
        let handle = ClusterHandle::new("mgmt");
        assert_eq!(handle.name, "mgmt");
        assert!(handle.kubeconfig_path.is_none());

        let handle = handle.with_kubeconfig("/tmp/mgmt.kubeconfig");
        assert_eq!(
            handle.kubeconfig_path.unwrap(),
            std::path::PathBuf::from("/tmp/mgmt.kubeconfig")
        );
    }
}
