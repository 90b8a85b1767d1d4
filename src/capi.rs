//! Typed views of Cluster API objects
//!
//! The system consumes CAPI resources it does not own. These views carry just
//! the fields operation detection and the wait loops read, and tolerate any
//! extra fields the server returns. They parse from [`DynamicObject`]s
//! fetched through the cluster client.

use kube::api::DynamicObject;
use serde::Deserialize;

use crate::{Error, Result};

/// A Kubernetes-style condition
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready", "Available", "NodeHealthy")
    #[serde(rename = "type")]
    pub type_: String,
    /// Condition status: "True", "False", or "Unknown"
    #[serde(default)]
    pub status: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Find a condition by type
pub fn find_condition<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the named condition is present and True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Whether the named condition is present and False
pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == "False")
}

/// Reference to another object
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Referenced kind
    #[serde(default)]
    pub kind: String,
    /// Referenced name
    #[serde(default)]
    pub name: String,
}

fn parse_view<T: for<'de> Deserialize<'de>>(obj: &DynamicObject, kind: &str) -> Result<T> {
    let mut data = obj.data.clone();
    // Fold the typed metadata back in so views can read the name uniformly.
    data["metadata"] = serde_json::json!({
        "name": obj.metadata.name.clone().unwrap_or_default(),
        "namespace": obj.metadata.namespace.clone(),
        "annotations": obj.metadata.annotations.clone().unwrap_or_default(),
    });
    serde_json::from_value(data)
        .map_err(|e| Error::serialization(format!("parsing {kind} {:?}: {e}", obj.metadata.name)))
}

/// Metadata subset carried by every view
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct MetadataView {
    /// Object name
    #[serde(default)]
    pub name: String,
    /// Object namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Annotations
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// KubeadmControlPlane view
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct KubeadmControlPlane {
    /// Object metadata
    #[serde(default)]
    pub metadata: MetadataView,
    /// Spec fields read by detection
    #[serde(default)]
    pub spec: KubeadmControlPlaneSpec,
    /// Status fields read by waits
    #[serde(default)]
    pub status: KubeadmControlPlaneStatus,
}

/// KubeadmControlPlane spec subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneSpec {
    /// Kubernetes version
    #[serde(default)]
    pub version: String,
    /// Desired replicas
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Machine template reference
    #[serde(default)]
    pub machine_template: MachineTemplateRef,
}

/// The machineTemplate block of a KubeadmControlPlane
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateRef {
    /// Infrastructure template reference
    #[serde(default)]
    pub infrastructure_ref: ObjectRef,
}

/// KubeadmControlPlane status subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneStatus {
    /// Replicas reporting ready
    #[serde(default)]
    pub ready_replicas: Option<i32>,
    /// Observed replicas
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl KubeadmControlPlane {
    /// Parse from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        parse_view(obj, "KubeadmControlPlane")
    }

    /// Whether the control plane reports the Available condition True
    pub fn is_available(&self) -> bool {
        is_condition_true(&self.status.conditions, "Available")
    }

    /// Whether the control plane reports the Ready condition True
    pub fn is_ready(&self) -> bool {
        is_condition_true(&self.status.conditions, "Ready")
    }
}

/// MachineDeployment view
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MachineDeployment {
    /// Object metadata
    #[serde(default)]
    pub metadata: MetadataView,
    /// Spec fields read by detection
    #[serde(default)]
    pub spec: MachineDeploymentSpec,
    /// Status fields read by waits
    #[serde(default)]
    pub status: MachineDeploymentStatus,
}

/// MachineDeployment spec subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    /// Desired replicas
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Machine template
    #[serde(default)]
    pub template: MachineDeploymentTemplate,
}

/// The template block of a MachineDeployment
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MachineDeploymentTemplate {
    /// Template spec
    #[serde(default)]
    pub spec: MachineDeploymentTemplateSpec,
}

/// The template.spec block of a MachineDeployment
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentTemplateSpec {
    /// Infrastructure machine template reference
    #[serde(default)]
    pub infrastructure_ref: ObjectRef,
    /// Bootstrap config reference
    #[serde(default)]
    pub bootstrap: BootstrapRef,
    /// Kubernetes version
    #[serde(default)]
    pub version: Option<String>,
}

/// The bootstrap block of a machine template spec
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRef {
    /// Bootstrap config template reference
    #[serde(default)]
    pub config_ref: ObjectRef,
}

/// MachineDeployment status subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStatus {
    /// Observed replicas
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Replicas reporting ready
    #[serde(default)]
    pub ready_replicas: Option<i32>,
}

impl MachineDeployment {
    /// Parse from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        parse_view(obj, "MachineDeployment")
    }

    /// Whether every desired replica reports ready
    pub fn all_replicas_ready(&self) -> bool {
        let desired = self.spec.replicas.unwrap_or(0);
        self.status.ready_replicas.unwrap_or(0) >= desired && desired > 0
    }
}

/// Machine view
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Machine {
    /// Object metadata
    #[serde(default)]
    pub metadata: MetadataView,
    /// Status fields read by the readiness poll
    #[serde(default)]
    pub status: MachineStatus,
}

/// Machine status subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Reference to the node this machine backs, set once registered
    #[serde(default)]
    pub node_ref: Option<ObjectRef>,
    /// Conditions (NodeHealthy is the one the poll reads)
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Machine {
    /// Parse from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        parse_view(obj, "Machine")
    }

    /// Whether the machine has registered a node
    pub fn has_node_ref(&self) -> bool {
        self.status.node_ref.is_some()
    }

    /// The NodeHealthy condition, when reported
    pub fn node_healthy(&self) -> Option<&Condition> {
        find_condition(&self.status.conditions, "NodeHealthy")
    }
}

/// CAPI Cluster view
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CapiCluster {
    /// Object metadata
    #[serde(default)]
    pub metadata: MetadataView,
    /// Status subset
    #[serde(default)]
    pub status: CapiClusterStatus,
}

/// CAPI Cluster status subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapiClusterStatus {
    /// Conditions (Ready gates moves)
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CapiCluster {
    /// Parse from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        parse_view(obj, "Cluster")
    }

    /// Whether the cluster reports Ready=True
    pub fn is_ready(&self) -> bool {
        is_condition_true(&self.status.conditions, "Ready")
    }
}

/// EtcdadmCluster view
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct EtcdadmCluster {
    /// Object metadata
    #[serde(default)]
    pub metadata: MetadataView,
    /// Spec subset
    #[serde(default)]
    pub spec: EtcdadmClusterSpec,
    /// Status subset
    #[serde(default)]
    pub status: EtcdadmClusterStatus,
}

/// EtcdadmCluster spec subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdadmClusterSpec {
    /// Infrastructure template reference
    #[serde(default)]
    pub infrastructure_template: ObjectRef,
}

/// EtcdadmCluster status subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdadmClusterStatus {
    /// Whether the etcd cluster reports ready
    #[serde(default)]
    pub ready: bool,
}

impl EtcdadmCluster {
    /// Parse from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        parse_view(obj, "EtcdadmCluster")
    }
}

/// BMC machine view (Contactable pre-flight)
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct BmcMachine {
    /// Object metadata
    #[serde(default)]
    pub metadata: MetadataView,
    /// Status subset
    #[serde(default)]
    pub status: BmcMachineStatus,
}

/// BMC machine status subset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BmcMachineStatus {
    /// Conditions (Contactable is the one the pre-flight reads)
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl BmcMachine {
    /// Parse from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        parse_view(obj, "Machine")
    }

    /// The Contactable condition, when reported
    pub fn contactable(&self) -> Option<&Condition> {
        find_condition(&self.status.conditions, "Contactable")
    }
}
