//! Cluster custom resource and supporting configuration types

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Desired state of a managed cluster
///
/// This is the root configuration object. It references a datacenter config
/// and one machine config per machine group; together with the versions
/// bundle they form the full spec model.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "anywhere.foundry.dev",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Unique cluster name (DNS label)
    pub name: String,

    /// Kubernetes version tag to deploy (e.g. "1.23")
    pub kubernetes_version: String,

    /// Control plane configuration
    pub control_plane: ControlPlaneConfig,

    /// Ordered worker node groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_node_groups: Vec<WorkerNodeGroupConfig>,

    /// External etcd topology; stacked etcd when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_etcd: Option<ExternalEtcdConfig>,

    /// Cluster networking (pod/service CIDRs, DNS)
    pub cluster_network: ClusterNetwork,

    /// Datacenter config reference; its kind selects the provider reconciler
    pub datacenter_ref: Ref,

    /// Outbound proxy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_configuration: Option<ProxyConfig>,

    /// Container registry mirror
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_mirror_configuration: Option<RegistryMirrorConfig>,

    /// Identity provider references (OIDC, AWS-IAM)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_provider_refs: Vec<Ref>,

    /// Pod IAM configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_iam_config: Option<PodIamConfig>,

    /// Management cluster reference; unset means self-managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_cluster: Option<ManagementClusterRef>,
}

/// Observed status of a managed cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// First fatal error of the last reconcile; cleared when validation passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Observed spec generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Reference to a named configuration object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Ref {
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
}

impl Ref {
    /// Convenience constructor
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Control plane topology and placement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Number of control plane nodes
    pub count: i32,

    /// Control plane endpoint
    pub endpoint: Endpoint,

    /// Machine group providing control plane machines
    pub machine_group_ref: Ref,

    /// Taints applied to control plane nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Node labels applied to control plane nodes
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,

    /// Rollout strategy for control plane upgrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_rollout_strategy: Option<RolloutStrategy>,
}

/// A host endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Endpoint {
    /// Host address (IP or DNS name)
    pub host: String,
}

/// Worker node group topology and placement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNodeGroupConfig {
    /// Group name, unique within the cluster
    pub name: String,

    /// Desired machine count; may be unset when autoscaling manages the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    /// Machine group providing this group's machines
    pub machine_group_ref: Ref,

    /// Node labels for this group
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,

    /// Taints for this group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Autoscaler bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling_configuration: Option<AutoScalingConfig>,

    /// Rollout strategy for group upgrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_rollout_strategy: Option<RolloutStrategy>,
}

impl WorkerNodeGroupConfig {
    /// Effective replica count (0 when unset)
    pub fn replicas(&self) -> i32 {
        self.count.unwrap_or(0)
    }

    /// Whether the autoscaler manages this group
    pub fn is_autoscaled(&self) -> bool {
        self.auto_scaling_configuration.is_some()
    }
}

/// Autoscaler bounds for a worker group
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalingConfig {
    /// Minimum machine count
    pub min_count: i32,
    /// Maximum machine count
    pub max_count: i32,
}

/// Rolling-update strategy
///
/// On a worker group both fields must be set; the control plane only honors
/// `max_surge`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Nodes that may be added above the desired count during a roll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<i32>,
    /// Nodes that may be unavailable during a roll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// External etcd topology
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEtcdConfig {
    /// Etcd member count; must be odd and at least 1
    pub count: i32,
    /// Machine group providing etcd machines
    pub machine_group_ref: Ref,
}

/// Node taint (key/value/effect)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect (NoSchedule, PreferNoSchedule, NoExecute)
    pub effect: String,
}

/// Cluster networking configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Pod CIDR blocks
    pub pods: CidrBlocks,
    /// Service CIDR blocks
    pub services: CidrBlocks,
    /// DNS overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
}

/// A list of CIDR blocks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CidrBlocks {
    /// CIDR blocks in order
    pub cidr_blocks: Vec<String>,
}

/// DNS configuration overrides
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    /// resolv.conf override handed to the kubelet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolv_conf: Option<ResolvConf>,
}

/// Path to a resolv.conf file
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResolvConf {
    /// File path on the node
    pub path: String,
}

/// Outbound proxy configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// HTTP proxy URL
    pub http_proxy: String,
    /// HTTPS proxy URL
    pub https_proxy: String,
    /// Hosts and CIDRs excluded from proxying, in user order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_proxy: Vec<String>,
}

/// Container registry mirror configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMirrorConfig {
    /// Mirror endpoint host
    pub endpoint: String,
    /// Mirror port (defaults to 443 when empty)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Per-namespace endpoint overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ocinamespaces: Vec<RegistryNamespace>,
    /// CA certificate content for the mirror
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert_content: String,
    /// Whether the mirror requires authentication
    #[serde(default)]
    pub authenticate: bool,
}

impl RegistryMirrorConfig {
    /// Base registry address, `host:port`
    pub fn base_registry(&self) -> String {
        let port = self.port.as_deref().filter(|p| !p.is_empty()).unwrap_or("443");
        format!("{}:{}", self.endpoint, port)
    }
}

/// Mapping from an upstream registry namespace to a mirror registry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryNamespace {
    /// Upstream registry (e.g. "public.ecr.aws")
    pub registry: String,
    /// Namespace under the mirror base
    pub namespace: String,
}

/// OIDC identity provider configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    /// Client ID
    pub client_id: String,
    /// Issuer URL
    pub issuer_url: String,
    /// Username claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_claim: Option<String>,
    /// Username prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_prefix: Option<String>,
    /// Groups claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups_claim: Option<String>,
    /// Groups prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups_prefix: Option<String>,
    /// Required claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_claims: Option<Vec<OidcClaim>>,
}

/// A required OIDC claim
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OidcClaim {
    /// Claim name
    pub claim: String,
    /// Required value
    pub value: String,
}

/// AWS-IAM authenticator configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsIamConfig {
    /// AWS region
    pub aws_region: String,
    /// Backend mode entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_mode: Vec<String>,
    /// Partition (defaults to "aws")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

/// Pod IAM configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodIamConfig {
    /// Service account token issuer URL
    pub service_account_issuer: String,
}

/// Management cluster reference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ManagementClusterRef {
    /// Management cluster name
    pub name: String,
}

/// Datacenter configuration, one variant per infrastructure provider
///
/// The variant's kind drives reconciler dispatch; the carried endpoint feeds
/// the rendered noProxy list.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DatacenterConfig {
    /// Local container-based sandbox; no placement configuration
    #[serde(rename = "DockerDatacenterConfig")]
    Docker {},

    /// Virtualization platform datacenter
    #[serde(rename = "VSphereDatacenterConfig", rename_all = "camelCase")]
    VSphere {
        /// vCenter server address
        server: String,
        /// Datacenter name
        datacenter: String,
        /// Network path
        network: String,
        /// TLS thumbprint
        #[serde(default, skip_serializing_if = "String::is_empty")]
        thumbprint: String,
        /// Skip TLS verification
        #[serde(default)]
        insecure: bool,
    },

    /// Bare-metal provisioner datacenter
    #[serde(rename = "TinkerbellDatacenterConfig", rename_all = "camelCase")]
    Tinkerbell {
        /// Boot/provisioning service IP
        #[serde(rename = "tinkerbellIP")]
        tinkerbell_ip: String,
        /// OS image base URL
        #[serde(default, skip_serializing_if = "String::is_empty")]
        os_image_url: String,
        /// Skip deploying the in-cluster load balancer
        #[serde(default)]
        skip_load_balancer_deployment: bool,
    },

    /// Cloud orchestration platform datacenter
    #[serde(rename = "CloudStackDatacenterConfig", rename_all = "camelCase")]
    CloudStack {
        /// Management server endpoint
        management_api_endpoint: String,
    },

    /// Edge appliance datacenter
    #[serde(rename = "SnowDatacenterConfig", rename_all = "camelCase")]
    Snow {},

    /// Hyper-converged platform datacenter
    #[serde(rename = "NutanixDatacenterConfig", rename_all = "camelCase")]
    Nutanix {
        /// Prism Central endpoint
        endpoint: String,
        /// Prism Central port
        #[serde(default)]
        port: u16,
    },
}

impl DatacenterConfig {
    /// The datacenter kind string used for reconciler dispatch
    pub fn kind(&self) -> DatacenterKind {
        match self {
            Self::Docker {} => DatacenterKind::Docker,
            Self::VSphere { .. } => DatacenterKind::VSphere,
            Self::Tinkerbell { .. } => DatacenterKind::Tinkerbell,
            Self::CloudStack { .. } => DatacenterKind::CloudStack,
            Self::Snow {} => DatacenterKind::Snow,
            Self::Nutanix { .. } => DatacenterKind::Nutanix,
        }
    }

    /// Endpoint appended to rendered noProxy lists, when the provider has one
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::VSphere { server, .. } => Some(server),
            Self::CloudStack {
                management_api_endpoint,
            } => Some(management_api_endpoint),
            Self::Nutanix { endpoint, .. } => Some(endpoint),
            Self::Docker {} | Self::Snow {} | Self::Tinkerbell { .. } => None,
        }
    }
}

/// Datacenter kinds used as reconciler-registry keys
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DatacenterKind {
    /// DockerDatacenterConfig
    Docker,
    /// VSphereDatacenterConfig
    VSphere,
    /// TinkerbellDatacenterConfig
    Tinkerbell,
    /// CloudStackDatacenterConfig
    CloudStack,
    /// SnowDatacenterConfig
    Snow,
    /// NutanixDatacenterConfig
    Nutanix,
}

impl std::fmt::Display for DatacenterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "DockerDatacenterConfig"),
            Self::VSphere => write!(f, "VSphereDatacenterConfig"),
            Self::Tinkerbell => write!(f, "TinkerbellDatacenterConfig"),
            Self::CloudStack => write!(f, "CloudStackDatacenterConfig"),
            Self::Snow => write!(f, "SnowDatacenterConfig"),
            Self::Nutanix => write!(f, "NutanixDatacenterConfig"),
        }
    }
}

impl std::str::FromStr for DatacenterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "docker" | "dockerdatacenterconfig" => Ok(Self::Docker),
            "vsphere" | "vspheredatacenterconfig" => Ok(Self::VSphere),
            "tinkerbell" | "tinkerbelldatacenterconfig" => Ok(Self::Tinkerbell),
            "cloudstack" | "cloudstackdatacenterconfig" => Ok(Self::CloudStack),
            "snow" | "snowdatacenterconfig" => Ok(Self::Snow),
            "nutanix" | "nutanixdatacenterconfig" => Ok(Self::Nutanix),
            _ => Err(Error::validation(format!(
                "unknown provider kind: {s}, expected one of: docker, vsphere, snow, tinkerbell, cloudstack, nutanix"
            ))),
        }
    }
}

/// Parsed Kubernetes version tag (`v1.23.7`, `1.23`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubeVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl KubeVersion {
    /// Parse a version tag, accepting an optional `v` prefix and patch suffix
    pub fn parse(tag: &str) -> Result<Self> {
        let trimmed = tag.trim().strip_prefix('v').unwrap_or(tag.trim());
        let mut parts = trimmed.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::validation(format!("invalid kubernetes version: {tag}")))?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::validation(format!("invalid kubernetes version: {tag}")))?;
        Ok(Self { major, minor })
    }
}
