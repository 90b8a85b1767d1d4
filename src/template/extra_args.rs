//! Component flag sets rendered into kubeadm configuration
//!
//! Each Kubernetes component (apiserver, controller-manager, scheduler, etcd,
//! kubelet) takes a flag→value map. Builders below assemble the maps from the
//! spec model; `to_partial_yaml` produces the JSON object embedded in the
//! rendered manifests. Maps are ordered for deterministic output.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::spec::{
    AwsIamConfig, ClusterNetwork, ControlPlaneConfig, OidcConfig, PodIamConfig,
    WorkerNodeGroupConfig,
};

/// Cipher suites accepted by rendered components
pub const SECURE_CIPHER_SUITES: &str = "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384";

/// An ordered flag→value map for one component
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtraArgs(BTreeMap<String, String>);

impl ExtraArgs {
    /// Empty flag set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a flag
    pub fn insert(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(flag.into(), value.into());
        self
    }

    /// Merge another flag set into this one; other's entries win on conflict
    pub fn append(mut self, other: ExtraArgs) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Whether any flags are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flag value, when set
    pub fn get(&self, flag: &str) -> Option<&str> {
        self.0.get(flag).map(String::as_str)
    }

    /// The partial YAML (JSON object) form embedded in manifests
    pub fn to_partial_yaml(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

/// TLS cipher suite restriction shared by apiserver/controller-manager/
/// scheduler/kubelet
pub fn secure_tls_cipher_suites() -> ExtraArgs {
    ExtraArgs::new().insert("tls-cipher-suites", SECURE_CIPHER_SUITES)
}

/// TLS cipher suite restriction for stacked etcd
pub fn secure_etcd_tls_cipher_suites() -> ExtraArgs {
    ExtraArgs::new().insert("cipher-suites", SECURE_CIPHER_SUITES)
}

/// OIDC apiserver flags, empty when no OIDC provider is configured
pub fn oidc_extra_args(oidc: Option<&OidcConfig>) -> ExtraArgs {
    let Some(oidc) = oidc else {
        return ExtraArgs::new();
    };
    let mut args = ExtraArgs::new()
        .insert("oidc-client-id", &oidc.client_id)
        .insert("oidc-issuer-url", &oidc.issuer_url);
    if let Some(claim) = &oidc.username_claim {
        args = args.insert("oidc-username-claim", claim);
    }
    if let Some(prefix) = &oidc.username_prefix {
        args = args.insert("oidc-username-prefix", prefix);
    }
    if let Some(claim) = &oidc.groups_claim {
        args = args.insert("oidc-groups-claim", claim);
    }
    if let Some(prefix) = &oidc.groups_prefix {
        args = args.insert("oidc-groups-prefix", prefix);
    }
    if let Some(required) = &oidc.required_claims {
        if let Some(first) = required.first() {
            args = args.insert(
                "oidc-required-claim",
                format!("{}={}", first.claim, first.value),
            );
        }
    }
    args
}

/// AWS-IAM authenticator apiserver flags
pub fn aws_iam_auth_extra_args(aws_iam: Option<&AwsIamConfig>) -> ExtraArgs {
    if aws_iam.is_none() {
        return ExtraArgs::new();
    }
    ExtraArgs::new().insert(
        "authentication-token-webhook-config-file",
        "/etc/kubernetes/aws-iam-authenticator/kubeconfig.yaml",
    )
}

/// Pod IAM apiserver flags
pub fn pod_iam_auth_extra_args(pod_iam: Option<&PodIamConfig>) -> ExtraArgs {
    let Some(pod_iam) = pod_iam else {
        return ExtraArgs::new();
    };
    ExtraArgs::new()
        .insert("service-account-issuer", &pod_iam.service_account_issuer)
        .insert(
            "service-account-jwks-uri",
            format!(
                "{}/openid/v1/jwks",
                pod_iam.service_account_issuer.trim_end_matches('/')
            ),
        )
}

/// Feature-gate apiserver flag
pub fn feature_gates_extra_args(gates: &[&str]) -> ExtraArgs {
    if gates.is_empty() {
        return ExtraArgs::new();
    }
    ExtraArgs::new().insert("feature-gates", gates.join(","))
}

/// Kubelet resolv.conf override
pub fn resolv_conf_extra_args(network: &ClusterNetwork) -> ExtraArgs {
    match network.dns.as_ref().and_then(|d| d.resolv_conf.as_ref()) {
        Some(resolv) => ExtraArgs::new().insert("resolv-conf", &resolv.path),
        None => ExtraArgs::new(),
    }
}

/// Controller-manager node CIDR mask size, derived from the pod network
///
/// Only emitted when a single pod CIDR is configured; the mask leaves 8 bits
/// of host space per node.
pub fn node_cidr_mask_extra_args(network: &ClusterNetwork) -> ExtraArgs {
    let cidrs = &network.pods.cidr_blocks;
    if cidrs.len() != 1 {
        return ExtraArgs::new();
    }
    let Some((_, prefix)) = cidrs[0].split_once('/') else {
        return ExtraArgs::new();
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return ExtraArgs::new();
    };
    let mask = (prefix + 8).min(32);
    ExtraArgs::new().insert("node-cidr-mask-size", mask.to_string())
}

/// Kubelet node labels for control plane nodes
pub fn control_plane_node_labels_extra_args(cp: &ControlPlaneConfig) -> ExtraArgs {
    node_labels_args(&cp.labels)
}

/// Kubelet node labels for a worker group
pub fn worker_node_labels_extra_args(group: &WorkerNodeGroupConfig) -> ExtraArgs {
    node_labels_args(&group.labels)
}

fn node_labels_args(labels: &BTreeMap<String, String>) -> ExtraArgs {
    if labels.is_empty() {
        return ExtraArgs::new();
    }
    let joined = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    ExtraArgs::new().insert("node-labels", joined)
}
