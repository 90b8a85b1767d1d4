//! Object and template naming
//!
//! Machine-template names are the rotation signal: a fresh timestamp suffix
//! is minted only when node re-creation is intended, and reusing the current
//! on-cluster name preserves the existing nodes. Everything else derives
//! stable names from the cluster and group names.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Injectable clock for deterministic template names in tests
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The system clock
pub fn system_now() -> NowFn {
    Arc::new(Utc::now)
}

/// A fixed clock for tests
pub fn fixed_now(at: DateTime<Utc>) -> NowFn {
    Arc::new(move || at)
}

/// Control plane machine template name with timestamp suffix
pub fn cp_machine_template_name(cluster_name: &str, now: &NowFn) -> String {
    format!("{}-control-plane-template-{}", cluster_name, now().timestamp())
}

/// External etcd machine template name with timestamp suffix
pub fn etcd_machine_template_name(cluster_name: &str, now: &NowFn) -> String {
    format!("{}-etcd-template-{}", cluster_name, now().timestamp())
}

/// Worker machine template name with timestamp suffix
pub fn worker_machine_template_name(cluster_name: &str, group_name: &str, now: &NowFn) -> String {
    format!("{}-{}-{}", cluster_name, group_name, now().timestamp())
}

/// Kubeadm config template name with timestamp suffix
pub fn kubeadm_config_template_name(cluster_name: &str, group_name: &str, now: &NowFn) -> String {
    format!("{}-{}-template-{}", cluster_name, group_name, now().timestamp())
}

/// MachineDeployment name for a worker group (stable)
pub fn machine_deployment_name(cluster_name: &str, group_name: &str) -> String {
    format!("{cluster_name}-{group_name}")
}

/// KubeadmControlPlane name (stable)
pub fn kubeadm_control_plane_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

/// EtcdadmCluster name (stable)
pub fn etcdadm_cluster_name(cluster_name: &str) -> String {
    format!("{cluster_name}-etcd")
}
