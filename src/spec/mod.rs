//! Cluster spec model
//!
//! The spec model is the typed, in-memory form of a cluster's desired state:
//! the `Cluster` custom resource plus its datacenter config, machine configs,
//! and the immutable versions bundle. It is built once per reconciliation
//! from persisted resources and never mutated by the core.

mod bundle;
mod cluster;
mod machine;
mod validate;

pub use bundle::{ImageRef, KubeDistro, VersionsBundle};
pub use cluster::{
    AutoScalingConfig, AwsIamConfig, CidrBlocks, Cluster, ClusterNetwork, ClusterSpec,
    ClusterStatus, ControlPlaneConfig, DatacenterConfig, DatacenterKind, DnsConfig, Endpoint,
    ExternalEtcdConfig, KubeVersion, ManagementClusterRef, OidcClaim, OidcConfig, PodIamConfig,
    ProxyConfig, Ref, RegistryMirrorConfig, RegistryNamespace, ResolvConf, RolloutStrategy, Taint,
    WorkerNodeGroupConfig,
};
pub use machine::{
    strip_ssh_key_comment, BottlerocketSettings, HostOsConfig, MachineConfig, NtpConfig, OsFamily,
    Placement, UserConfig, VspherePlacement,
};
pub use validate::validate_spec;

use std::collections::BTreeMap;

use crate::Result;

/// Fully-resolved cluster spec: the input to rendering and reconciliation
///
/// Owns everything a provider reconciler needs to build manifests. Immutable
/// after [`Spec::new`]; a reconciliation that observes new desired state
/// builds a fresh one.
#[derive(Clone, Debug)]
pub struct Spec {
    /// The cluster object (metadata + spec + last observed status)
    pub cluster: Cluster,
    /// Datacenter configuration referenced by the cluster
    pub datacenter: DatacenterConfig,
    /// Machine configs keyed by name; every machine-group ref resolves here
    pub machine_configs: BTreeMap<String, MachineConfig>,
    /// Immutable component image registry/tag pairs
    pub bundle: VersionsBundle,
    /// Resolved OIDC identity provider config, when referenced
    pub oidc_config: Option<OidcConfig>,
    /// Resolved AWS-IAM identity provider config, when referenced
    pub aws_iam_config: Option<AwsIamConfig>,
}

impl Spec {
    /// Assemble and validate a spec model
    pub fn new(
        cluster: Cluster,
        datacenter: DatacenterConfig,
        machine_configs: BTreeMap<String, MachineConfig>,
        bundle: VersionsBundle,
    ) -> Result<Self> {
        let spec = Self {
            cluster,
            datacenter,
            machine_configs,
            bundle,
            oidc_config: None,
            aws_iam_config: None,
        };
        validate_spec(&spec)?;
        Ok(spec)
    }

    /// Attach a resolved OIDC config
    pub fn with_oidc_config(mut self, oidc: OidcConfig) -> Self {
        self.oidc_config = Some(oidc);
        self
    }

    /// Attach a resolved AWS-IAM config
    pub fn with_aws_iam_config(mut self, aws_iam: AwsIamConfig) -> Self {
        self.aws_iam_config = Some(aws_iam);
        self
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.cluster.spec.name
    }

    /// Whether this cluster is managed by a separate management cluster
    pub fn is_managed(&self) -> bool {
        self.cluster
            .spec
            .management_cluster
            .as_ref()
            .is_some_and(|m| m.name != self.cluster.spec.name)
    }

    /// Machine config for the control plane machine group
    pub fn control_plane_machine_config(&self) -> Option<&MachineConfig> {
        self.machine_configs
            .get(&self.cluster.spec.control_plane.machine_group_ref.name)
    }

    /// Machine config for a worker group
    pub fn worker_machine_config(&self, group: &WorkerNodeGroupConfig) -> Option<&MachineConfig> {
        self.machine_configs.get(&group.machine_group_ref.name)
    }

    /// Machine config for the external etcd machine group, when configured
    pub fn etcd_machine_config(&self) -> Option<&MachineConfig> {
        let etcd = self.cluster.spec.external_etcd.as_ref()?;
        self.machine_configs.get(&etcd.machine_group_ref.name)
    }
}
