//! Infrastructure provider reconcilers
//!
//! A provider reconciler owns the decision of which machine templates rotate
//! and which are preserved, and orchestrates rendering accordingly. The
//! decision is a pure function of the current on-cluster state and the new
//! spec. Template names are the only rotation signal: minting a fresh
//! timestamped name rolls the nodes referencing it, reusing the current name
//! preserves them.
//!
//! # Providers
//!
//! - [`DockerReconciler`] - local container-based sandbox
//! - [`VSphereReconciler`] - virtualization platform
//! - [`TinkerbellReconciler`] - bare-metal provisioner with hardware
//!   validation

mod docker;
mod tinkerbell;
mod vsphere;

pub use docker::DockerReconciler;
pub use tinkerbell::TinkerbellReconciler;
pub use vsphere::VSphereReconciler;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::capi::{KubeadmControlPlane, MachineDeployment};
use crate::client::{ClusterClient, ETCDADM_CLUSTER};
use crate::manifest;
use crate::spec::{DatacenterKind, Spec, WorkerNodeGroupConfig};
use crate::template::names::{
    cp_machine_template_name, etcd_machine_template_name, etcdadm_cluster_name,
    kubeadm_config_template_name, machine_deployment_name, worker_machine_template_name,
};
use crate::template::{InfraTemplates, NowFn, TemplateRenderer, Values};
use crate::{ClusterHandle, Error, Result};

/// Annotation signalling the external etcd cluster is mid-upgrade
///
/// The control plane controller refuses to roll while this is present; the
/// etcd controller removes it once the new members report ready.
pub const ETCD_UPGRADE_IN_PROGRESS_ANNOTATION: &str =
    "etcdcluster.cluster.x-k8s.io/upgrade-in-progress";

/// The desired change detected for a reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// No KubeadmControlPlane exists yet
    NewCluster,
    /// Replica counts differ but no template-affecting field changed
    ScaleOnly,
    /// Kubernetes version changed
    VersionUpgrade,
    /// Worker machine attributes changed for the named groups
    WorkloadTemplateChange {
        /// Affected worker group names
        groups: Vec<String>,
    },
    /// Worker kubeadm config fields changed for the named groups
    KubeadmConfigChange {
        /// Affected worker group names
        groups: Vec<String>,
    },
    /// Nothing differs
    NoChange,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewCluster => write!(f, "NewCluster"),
            Self::ScaleOnly => write!(f, "Scale"),
            Self::VersionUpgrade => write!(f, "K8sVersionUpgrade"),
            Self::WorkloadTemplateChange { .. } => write!(f, "WorkloadTemplateChange"),
            Self::KubeadmConfigChange { .. } => write!(f, "KubeadmConfigChange"),
            Self::NoChange => write!(f, "NoChange"),
        }
    }
}

/// Rendered create output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedSpecs {
    /// Control plane document stream
    pub control_plane: Vec<u8>,
    /// Workers document stream
    pub workers: Vec<u8>,
}

/// Rendered upgrade output plus the detected operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeRender {
    /// Detected operation; `NoChange` is the no-op sentinel
    pub operation: Operation,
    /// Control plane document stream
    pub control_plane: Vec<u8>,
    /// Workers document stream
    pub workers: Vec<u8>,
}

/// Per-provider reconciler surface
///
/// Reconcilers borrow a [`ClusterClient`] (shared, concurrency-safe) and hold
/// no state between calls.
#[async_trait]
pub trait ProviderReconciler: Send + Sync {
    /// The datacenter kind this reconciler serves
    fn kind(&self) -> DatacenterKind;

    /// The provider machine template kind (scale-only stripping target)
    fn machine_template_kind(&self) -> String;

    /// Render the full create stream with fresh template names
    async fn render_for_create(&self, spec: &Spec) -> Result<RenderedSpecs>;

    /// Render the upgrade stream, preserving or rotating template names per
    /// the detected operation
    async fn render_for_upgrade(
        &self,
        bootstrap: &ClusterHandle,
        workload: &ClusterHandle,
        current: &Spec,
        new: &Spec,
    ) -> Result<UpgradeRender>;

    /// Provider pre-flight for the detected operation (hardware, quotas)
    async fn preflight(&self, _spec: &Spec, _operation: &Operation) -> Result<()> {
        Ok(())
    }

    /// Rewrite a fetched workload kubeconfig (endpoint substitution)
    async fn update_kubeconfig(&self, _spec: &Spec, kubeconfig: Vec<u8>) -> Result<Vec<u8>> {
        Ok(kubeconfig)
    }

    /// Hook between control-plane and worker upgrades
    async fn run_post_control_plane_upgrade(&self, _spec: &Spec) -> Result<()> {
        Ok(())
    }

    /// Hook after the full upgrade to fix CNI-side drift
    async fn run_post_control_plane_upgrade_setup(&self, _spec: &Spec) -> Result<()> {
        Ok(())
    }

    /// Validation after a self-managed cluster is deleted
    async fn post_cluster_delete_validate(&self, _spec: &Spec) -> Result<()> {
        Ok(())
    }

    /// Provider storage class manifest, when the provider ships one
    fn storage_class_manifest(&self, _spec: &Spec) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

// =============================================================================
// Operation detection: pure functions over observed state
// =============================================================================

/// Detect the operation implied by the current on-cluster state and new spec
///
/// Rejects a reconciliation that mixes a scale with any rolling change; the
/// admission webhook enforces the same restriction upstream, so hitting this
/// here means the webhook was bypassed.
pub fn detect_operation(
    current_kcp: Option<&KubeadmControlPlane>,
    current_mds: &BTreeMap<String, MachineDeployment>,
    current: &Spec,
    new: &Spec,
) -> Result<Operation> {
    let Some(kcp) = current_kcp else {
        return Ok(Operation::NewCluster);
    };

    let version_change = kcp.spec.version != new.bundle.kube_distro.kubernetes.tag;

    let cp_scale = kcp.spec.replicas != Some(new.cluster.spec.control_plane.count);

    let current_groups = group_map(current);
    let mut worker_scale = false;
    let mut template_groups = Vec::new();
    let mut kubeadm_groups = Vec::new();

    for group in &new.cluster.spec.worker_node_groups {
        let md_name = machine_deployment_name(new.name(), &group.name);
        let existed_before = current_groups.contains_key(group.name.as_str());

        if !existed_before {
            // A brand new group always mints fresh templates.
            template_groups.push(group.name.clone());
            continue;
        }

        if needs_new_workload_template(current, new, group) {
            template_groups.push(group.name.clone());
        }
        if let Some(previous) = current_groups.get(group.name.as_str()) {
            if needs_new_kubeadm_config_template(previous, group) {
                kubeadm_groups.push(group.name.clone());
            }
        }

        match current_mds.get(&md_name) {
            Some(md) if md.spec.replicas != Some(group.replicas()) => worker_scale = true,
            // Group existed in the previous spec but its deployment is gone:
            // treat as a scale so the replica count gets re-applied.
            None => worker_scale = true,
            Some(_) => {}
        }
    }

    let scale_change = cp_scale || worker_scale;
    let rolling_change =
        version_change || !template_groups.is_empty() || !kubeadm_groups.is_empty();

    if scale_change && rolling_change {
        return Err(Error::policy(
            "cannot scale the cluster and roll nodes in the same reconciliation",
        ));
    }

    let operation = if scale_change {
        Operation::ScaleOnly
    } else if version_change {
        Operation::VersionUpgrade
    } else if !template_groups.is_empty() {
        Operation::WorkloadTemplateChange {
            groups: template_groups,
        }
    } else if !kubeadm_groups.is_empty() {
        Operation::KubeadmConfigChange {
            groups: kubeadm_groups,
        }
    } else {
        Operation::NoChange
    };

    Ok(operation)
}

fn group_map(spec: &Spec) -> BTreeMap<&str, &WorkerNodeGroupConfig> {
    spec.cluster
        .spec
        .worker_node_groups
        .iter()
        .map(|g| (g.name.as_str(), g))
        .collect()
}

/// Whether the control plane machine template must rotate
pub fn needs_new_control_plane_template(current: &Spec, new: &Spec) -> bool {
    current.cluster.spec.kubernetes_version != new.cluster.spec.kubernetes_version
        || current.bundle != new.bundle
        || current.datacenter != new.datacenter
        || current.control_plane_machine_config() != new.control_plane_machine_config()
}

/// Whether a worker group's machine template must rotate
pub fn needs_new_workload_template(
    current: &Spec,
    new: &Spec,
    group: &WorkerNodeGroupConfig,
) -> bool {
    if current.cluster.spec.kubernetes_version != new.cluster.spec.kubernetes_version
        || current.bundle != new.bundle
        || current.datacenter != new.datacenter
    {
        return true;
    }
    let previous_group = current
        .cluster
        .spec
        .worker_node_groups
        .iter()
        .find(|g| g.name == group.name);
    match previous_group {
        Some(previous) => {
            current.machine_configs.get(&previous.machine_group_ref.name)
                != new.machine_configs.get(&group.machine_group_ref.name)
        }
        None => true,
    }
}

/// Whether a worker group's kubeadm config template must rotate
pub fn needs_new_kubeadm_config_template(
    previous: &WorkerNodeGroupConfig,
    group: &WorkerNodeGroupConfig,
) -> bool {
    previous.taints != group.taints || previous.labels != group.labels
}

// =============================================================================
// Shared render flows
// =============================================================================

/// Render a create stream with fresh timestamped names everywhere
pub fn render_create_with(
    infra: &dyn InfraTemplates,
    now: &NowFn,
    spec: &Spec,
) -> Result<RenderedSpecs> {
    let cluster_name = spec.name().to_string();
    let renderer = TemplateRenderer::new(infra);

    let cp_name = cp_machine_template_name(&cluster_name, now);
    let etcd_name = etcd_machine_template_name(&cluster_name, now);
    let cp_opt = move |values: &mut Values| {
        values.insert("controlPlaneTemplateName".into(), json!(cp_name));
        values.insert("etcdTemplateName".into(), json!(etcd_name));
    };

    let control_plane = renderer.render_control_plane(spec, &[&cp_opt])?;

    let mut workload_names = BTreeMap::new();
    let mut kubeadm_names = BTreeMap::new();
    for group in &spec.cluster.spec.worker_node_groups {
        workload_names.insert(
            group.name.clone(),
            worker_machine_template_name(&cluster_name, &group.name, now),
        );
        kubeadm_names.insert(
            group.name.clone(),
            kubeadm_config_template_name(&cluster_name, &group.name, now),
        );
    }
    let workers = renderer.render_workers(spec, &workload_names, &kubeadm_names)?;

    Ok(RenderedSpecs {
        control_plane,
        workers,
    })
}

/// Render an upgrade stream, preserving or rotating template names
///
/// The decision flow:
/// 1. Read current KubeadmControlPlane and MachineDeployments.
/// 2. Detect the operation; reject scale+rolling combinations.
/// 3. Preserve every template name whose inputs did not change; mint fresh
///    timestamped names for the rest.
/// 4. With external etcd on a version upgrade, annotate the etcd cluster
///    `upgrade-in-progress=true` before minting the control plane name so
///    the control plane holds its roll until etcd reports ready.
/// 5. On a scale, strip every provider machine template document so the
///    residual apply only mutates replica counts.
pub async fn render_upgrade_with(
    infra: &dyn InfraTemplates,
    client: &Arc<dyn ClusterClient>,
    now: &NowFn,
    current: &Spec,
    new: &Spec,
) -> Result<UpgradeRender> {
    let cluster_name = new.name().to_string();
    let namespace = crate::SYSTEM_NAMESPACE;

    let current_kcp = client
        .get_kubeadm_control_plane(namespace, &cluster_name)
        .await?;

    let mut current_mds = BTreeMap::new();
    for group in &new.cluster.spec.worker_node_groups {
        let md_name = machine_deployment_name(&cluster_name, &group.name);
        if let Some(md) = client.get_machine_deployment(namespace, &md_name).await? {
            current_mds.insert(md_name, md);
        }
    }

    let operation = detect_operation(current_kcp.as_ref(), &current_mds, current, new)?;
    info!(cluster = %cluster_name, operation = %operation, "operation detected");

    // Control plane template: preserve unless its inputs changed.
    let cp_template_name = if needs_new_control_plane_template(current, new) {
        cp_machine_template_name(&cluster_name, now)
    } else {
        match &current_kcp {
            Some(kcp) => kcp.spec.machine_template.infrastructure_ref.name.clone(),
            None => cp_machine_template_name(&cluster_name, now),
        }
    };

    // External etcd: rotation is pinned off, so the current on-cluster
    // template name is always reused. The upgrade annotation still has to
    // land before the new control plane template does, so the control plane
    // holds its roll until etcd reports ready.
    let mut etcd_template_name = String::new();
    if new.cluster.spec.external_etcd.is_some() {
        if operation == Operation::VersionUpgrade {
            client
                .update_annotations(
                    ETCDADM_CLUSTER,
                    namespace,
                    &etcdadm_cluster_name(&cluster_name),
                    BTreeMap::from([(
                        ETCD_UPGRADE_IN_PROGRESS_ANNOTATION.to_string(),
                        "true".to_string(),
                    )]),
                )
                .await?;
        }

        let etcdadm = client
            .get_etcdadm_cluster(namespace, &etcdadm_cluster_name(&cluster_name))
            .await?;
        etcd_template_name = match etcdadm {
            Some(etcd) => etcd.spec.infrastructure_template.name,
            None => etcd_machine_template_name(&cluster_name, now),
        };
    }

    // Worker templates: preserve or mint per group.
    let mut workload_names = BTreeMap::new();
    let mut kubeadm_names = BTreeMap::new();
    let current_groups = group_map(current);
    for group in &new.cluster.spec.worker_node_groups {
        let md_name = machine_deployment_name(&cluster_name, &group.name);
        let current_md = current_mds.get(&md_name);

        let workload_name = if !needs_new_workload_template(current, new, group) {
            current_md
                .map(|md| md.spec.template.spec.infrastructure_ref.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| worker_machine_template_name(&cluster_name, &group.name, now))
        } else {
            worker_machine_template_name(&cluster_name, &group.name, now)
        };
        workload_names.insert(group.name.clone(), workload_name);

        let keep_kubeadm = current_groups
            .get(group.name.as_str())
            .is_some_and(|previous| !needs_new_kubeadm_config_template(previous, group));
        let kubeadm_name = if keep_kubeadm {
            current_md
                .map(|md| md.spec.template.spec.bootstrap.config_ref.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| kubeadm_config_template_name(&cluster_name, &group.name, now))
        } else {
            kubeadm_config_template_name(&cluster_name, &group.name, now)
        };
        kubeadm_names.insert(group.name.clone(), kubeadm_name);
    }

    let renderer = TemplateRenderer::new(infra);
    let cp_name = cp_template_name.clone();
    let etcd_name = etcd_template_name.clone();
    let cp_opt = move |values: &mut Values| {
        values.insert("controlPlaneTemplateName".into(), json!(cp_name));
        if !etcd_name.is_empty() {
            values.insert("etcdTemplateName".into(), json!(etcd_name));
        }
    };

    let mut control_plane = renderer.render_control_plane(new, &[&cp_opt])?;
    let mut workers = renderer.render_workers(new, &workload_names, &kubeadm_names)?;

    if operation == Operation::ScaleOnly {
        control_plane = manifest::strip_kind(&control_plane, infra.machine_template_kind())?;
        workers = manifest::strip_kind(&workers, infra.machine_template_kind())?;
        info!(cluster = %cluster_name, "machine templates omitted for scale");
    }

    Ok(UpgradeRender {
        operation,
        control_plane,
        workers,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::{
        BootstrapRef, KubeadmControlPlaneSpec, MachineDeploymentSpec, MachineDeploymentTemplate,
        MachineDeploymentTemplateSpec, MachineTemplateRef, MetadataView, ObjectRef,
    };
    use test_fixtures::docker_spec;

    fn kcp(version: &str, replicas: i32, template: &str) -> KubeadmControlPlane {
        KubeadmControlPlane {
            metadata: MetadataView {
                name: "mgmt".to_string(),
                ..Default::default()
            },
            spec: KubeadmControlPlaneSpec {
                version: version.to_string(),
                replicas: Some(replicas),
                machine_template: MachineTemplateRef {
                    infrastructure_ref: ObjectRef {
                        kind: "DockerMachineTemplate".to_string(),
                        name: template.to_string(),
                    },
                },
            },
            status: Default::default(),
        }
    }

    fn md(name: &str, replicas: i32, template: &str, kubeadm: &str) -> MachineDeployment {
        MachineDeployment {
            metadata: MetadataView {
                name: name.to_string(),
                ..Default::default()
            },
            spec: MachineDeploymentSpec {
                replicas: Some(replicas),
                template: MachineDeploymentTemplate {
                    spec: MachineDeploymentTemplateSpec {
                        infrastructure_ref: ObjectRef {
                            kind: "DockerMachineTemplate".to_string(),
                            name: template.to_string(),
                        },
                        bootstrap: BootstrapRef {
                            config_ref: ObjectRef {
                                kind: "KubeadmConfigTemplate".to_string(),
                                name: kubeadm.to_string(),
                            },
                        },
                        version: None,
                    },
                },
            },
            status: Default::default(),
        }
    }

    fn observed(groups: &[(&str, i32)]) -> BTreeMap<String, MachineDeployment> {
        groups
            .iter()
            .map(|(name, replicas)| {
                let md_name = format!("mgmt-{name}");
                (
                    md_name.clone(),
                    md(&md_name, *replicas, &format!("{md_name}-1"), &format!("{md_name}-template-1")),
                )
            })
            .collect()
    }

    // ==========================================================================
    // Story Tests: Operation Detection State Machine
    // ==========================================================================

    /// Story: a cluster with no KubeadmControlPlane has never been created
    #[test]
    fn story_no_control_plane_means_new_cluster() {
        let spec = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let op = detect_operation(None, &BTreeMap::new(), &spec, &spec).unwrap();
        assert_eq!(op, Operation::NewCluster);
    }

    /// Story: identical desired and observed state is a no-op
    #[test]
    fn story_identical_state_is_no_change() {
        let spec = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 2)]);

        let op = detect_operation(Some(&kcp), &mds, &spec, &spec).unwrap();
        assert_eq!(op, Operation::NoChange);
    }

    /// Story: a worker count bump with nothing else changed is a pure scale
    #[test]
    fn story_replica_bump_is_scale_only() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 1)]);
        let new = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 1)]);

        let op = detect_operation(Some(&kcp), &mds, &current, &new).unwrap();
        assert_eq!(op, Operation::ScaleOnly);
    }

    /// Story: a control plane count change is also a scale
    #[test]
    fn story_control_plane_replica_change_is_scale() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let new = docker_spec("mgmt", "1.23", 3, &[("md-0", 2)]);
        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 2)]);

        let op = detect_operation(Some(&kcp), &mds, &current, &new).unwrap();
        assert_eq!(op, Operation::ScaleOnly);
    }

    /// Story: a Kubernetes version change rolls every node
    #[test]
    fn story_version_change_is_upgrade() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let new = docker_spec("mgmt", "1.24", 1, &[("md-0", 2)]);
        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 2)]);

        let op = detect_operation(Some(&kcp), &mds, &current, &new).unwrap();
        assert_eq!(op, Operation::VersionUpgrade);
    }

    /// Story: scaling and upgrading in one reconcile is a policy violation
    #[test]
    fn story_scale_plus_upgrade_is_rejected() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 1)]);
        let new = docker_spec("mgmt", "1.24", 1, &[("md-0", 2)]);
        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 1)]);

        let err = detect_operation(Some(&kcp), &mds, &current, &new).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Policy);
    }

    /// Story: changing a worker group's machine config rolls only that group
    #[test]
    fn story_machine_config_change_is_template_change() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let mut new = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        new.machine_configs.get_mut("workers").unwrap().users[0].name = "bottlerocket".to_string();

        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 2)]);

        let op = detect_operation(Some(&kcp), &mds, &current, &new).unwrap();
        assert_eq!(
            op,
            Operation::WorkloadTemplateChange {
                groups: vec!["md-0".to_string()]
            }
        );
    }

    /// Story: changing worker taints rotates the kubeadm config template only
    #[test]
    fn story_taint_change_is_kubeadm_config_change() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let mut new = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        new.cluster.spec.worker_node_groups[0].taints = vec![crate::spec::Taint {
            key: "dedicated".to_string(),
            value: Some("infra".to_string()),
            effect: "NoSchedule".to_string(),
        }];

        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 2)]);

        let op = detect_operation(Some(&kcp), &mds, &current, &new).unwrap();
        assert_eq!(
            op,
            Operation::KubeadmConfigChange {
                groups: vec!["md-0".to_string()]
            }
        );
    }

    /// Story: an added worker group mints templates without being a scale
    #[test]
    fn story_added_group_is_template_change() {
        let current = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let new = docker_spec("mgmt", "1.23", 1, &[("md-0", 2), ("md-1", 1)]);
        let kcp = kcp("v1.23.7", 1, "mgmt-control-plane-template-1");
        let mds = observed(&[("md-0", 2)]);

        let op = detect_operation(Some(&kcp), &mds, &current, &new).unwrap();
        assert_eq!(
            op,
            Operation::WorkloadTemplateChange {
                groups: vec!["md-1".to_string()]
            }
        );
    }

    #[test]
    fn test_needs_new_cp_template_on_bundle_change() {
        let current = docker_spec("mgmt", "1.23", 1, &[]);
        let mut new = current.clone();
        assert!(!needs_new_control_plane_template(&current, &new));

        new.bundle.kube_distro.kubernetes.tag = "v1.23.9".to_string();
        assert!(needs_new_control_plane_template(&current, &new));
    }

    #[test]
    fn test_needs_new_kubeadm_template_on_label_change() {
        let spec = docker_spec("mgmt", "1.23", 1, &[("md-0", 2)]);
        let previous = spec.cluster.spec.worker_node_groups[0].clone();
        let mut changed = previous.clone();
        assert!(!needs_new_kubeadm_config_template(&previous, &changed));

        changed
            .labels
            .insert("tier".to_string(), "backend".to_string());
        assert!(needs_new_kubeadm_config_template(&previous, &changed));
    }
}
