//! Versions bundle: image registry/tag pairs for every rendered component
//!
//! The bundle is immutable for the life of a spec model. A bundle change on
//! upgrade is a spec change like any other and triggers template rotation.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A container image reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    /// Repository, including registry host (e.g. "public.ecr.aws/eks-distro/kubernetes")
    pub repository: String,
    /// Image tag
    pub tag: String,
}

impl ImageRef {
    /// Construct an image reference
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// `repository:tag`
    pub fn versioned(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Kubernetes distribution component images
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeDistro {
    /// Kubernetes core images; the tag is the cluster's full version
    pub kubernetes: ImageRef,
    /// Stacked etcd image
    pub etcd: ImageRef,
    /// CoreDNS image
    pub core_dns: ImageRef,
    /// Pause container image
    pub pause: ImageRef,
    /// External etcd version (etcdadm-managed)
    pub etcd_version: String,
    /// External etcd image
    pub etcd_image: ImageRef,
}

/// Bottlerocket host container images
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BottlerocketHostContainers {
    /// Kubeadm bootstrap host container
    pub kubeadm_bootstrap: ImageRef,
}

/// Immutable component versions rendered into cluster manifests
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionsBundle {
    /// Kubernetes distribution images
    pub kube_distro: KubeDistro,
    /// Bottlerocket host containers
    pub bottlerocket_host_containers: BottlerocketHostContainers,
    /// In-cluster virtual-IP load balancer image
    pub kube_vip: ImageRef,
}

impl VersionsBundle {
    /// A bundle for the given Kubernetes version with eks-distro defaults
    ///
    /// Used by `generate clusterconfig` and tests; production bundles come
    /// from release manifests.
    pub fn for_kubernetes_version(version: &str) -> Self {
        let distro = "public.ecr.aws/eks-distro";
        Self {
            kube_distro: KubeDistro {
                kubernetes: ImageRef::new(format!("{distro}/kubernetes"), version),
                etcd: ImageRef::new(format!("{distro}/etcd-io"), "v3.5.9"),
                core_dns: ImageRef::new(format!("{distro}/coredns"), "v1.10.1"),
                pause: ImageRef::new(format!("{distro}/kubernetes/pause"), "v1.23.17"),
                etcd_version: "3.5.9".to_string(),
                etcd_image: ImageRef::new(format!("{distro}/etcd-io/etcd"), "v3.5.9"),
            },
            bottlerocket_host_containers: BottlerocketHostContainers {
                kubeadm_bootstrap: ImageRef::new(
                    "public.ecr.aws/bottlerocket/bottlerocket-bootstrap",
                    "v0.1.0",
                ),
            },
            kube_vip: ImageRef::new("public.ecr.aws/kube-vip/kube-vip", "v0.5.5"),
        }
    }
}
